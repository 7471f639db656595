// Key-lifecycle controller
//
// Owns the persisted configuration record and sequences every state-bearing
// operation: keyless → loneKey (generate), loneKey → twoKeys (rotate), and
// back to loneKey on every signature. Entry is serialized through one async
// lock, so exactly one operation is in flight per proxy instance and queued
// callers proceed in FIFO order.
//
// A transition commits only after the security module has answered, and the
// record write is synchronous, so there is no await point between the
// device acting and the record landing on disk. If that write fails the
// controller latches: the device and the host disagree about the key state,
// and every state-bearing operation is refused until an erase succeeds.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::engine::RequestEngine;
use crate::store::{ConfigStore, LifecycleState, ProxyRecord, ProxySecret};
use crate::transport::codec::{flag_from_response, OpCode};
use crate::ProxyError;

struct Controller {
    /// Cached copy of the persisted record; `None` until first use.
    record: Option<ProxyRecord>,
    /// Set when a post-exchange persist failed. Cleared only by a
    /// successful erase.
    inconsistent: bool,
}

pub struct KeyLifecycle {
    engine: Arc<RequestEngine>,
    store: ConfigStore,
    state: Mutex<Controller>,
}

impl KeyLifecycle {
    pub fn new(engine: Arc<RequestEngine>, store: ConfigStore) -> Self {
        Self {
            engine,
            store,
            state: Mutex::new(Controller {
                record: None,
                inconsistent: false,
            }),
        }
    }

    /// The persisted instance tag, creating the record if this is the first
    /// use of the configured directory.
    pub async fn tag(&self) -> Result<String, ProxyError> {
        let mut ctl = self.state.lock().await;
        let record = self.load_record(&mut ctl)?;
        Ok(record.tag)
    }

    /// Current lifecycle state as persisted.
    pub async fn current_state(&self) -> Result<LifecycleState, ProxyError> {
        let mut ctl = self.state.lock().await;
        Ok(self.load_record(&mut ctl)?.state)
    }

    /// Ask the module to generate its key pair. Returns the new public key.
    pub async fn generate_keys(&self) -> Result<Vec<u8>, ProxyError> {
        let mut ctl = self.state.lock().await;
        self.ensure_usable(&ctl)?;
        let mut record = self.load_record(&mut ctl)?;

        if record.state != LifecycleState::Keyless {
            return Err(invalid_state(OpCode::GenerateKeys, record.state));
        }

        let secret = ProxySecret::generate();
        let public = self
            .engine
            .execute(OpCode::GenerateKeys, &[secret.as_bytes()])
            .await?;

        record.proxy_key = Some(secret);
        record.state = LifecycleState::LoneKey;
        self.commit(&mut ctl, record)?;

        info!("🔑 generated new key pair");
        Ok(public)
    }

    /// Supersede the current key pair. The old proxy secret stays in the
    /// record for exactly one more signature. Returns the new public key.
    pub async fn rotate_keys(&self) -> Result<Vec<u8>, ProxyError> {
        let mut ctl = self.state.lock().await;
        self.ensure_usable(&ctl)?;
        let mut record = self.load_record(&mut ctl)?;

        if record.state != LifecycleState::LoneKey {
            return Err(invalid_state(OpCode::RotateKeys, record.state));
        }
        let Some(previous) = record.proxy_key.clone() else {
            return Err(invalid_state(OpCode::RotateKeys, record.state));
        };

        let replacement = ProxySecret::generate();
        let public = self
            .engine
            .execute(
                OpCode::RotateKeys,
                &[previous.as_bytes(), replacement.as_bytes()],
            )
            .await?;

        record.previous_proxy_key = Some(previous);
        record.proxy_key = Some(replacement);
        record.state = LifecycleState::TwoKeys;
        self.commit(&mut ctl, record)?;

        info!("🔑 rotated key pair; superseded key armed for one final signature");
        Ok(public)
    }

    /// Erase the module's keys and remove the persisted record. This is also
    /// the recovery path out of a latched inconsistency.
    pub async fn erase_keys(&self) -> Result<bool, ProxyError> {
        let mut ctl = self.state.lock().await;

        let response = self.engine.execute(OpCode::EraseKeys, &[]).await?;
        // The module has already dropped its keys; a record that survives
        // here no longer describes the device.
        if let Err(err) = self.store.delete() {
            error!("erased keys but could not remove the record: {err}");
            ctl.inconsistent = true;
            return Err(ProxyError::InconsistentState);
        }
        ctl.record = None;
        ctl.inconsistent = false;

        info!("🔑 erased keys; configuration record removed");
        Ok(flag_from_response(&response))
    }

    /// Sign `bytes`. Consumes the superseded proxy secret if one is armed,
    /// otherwise signs with the current one. Returns the signature.
    pub async fn sign_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let mut ctl = self.state.lock().await;
        self.ensure_usable(&ctl)?;
        let mut record = self.load_record(&mut ctl)?;

        if record.state == LifecycleState::Keyless {
            return Err(invalid_state(OpCode::SignBytes, record.state));
        }

        let (secret, consumed_previous) = match (&record.previous_proxy_key, &record.proxy_key) {
            (Some(previous), _) => (previous.clone(), true),
            (None, Some(current)) => (current.clone(), false),
            (None, None) => return Err(invalid_state(OpCode::SignBytes, record.state)),
        };

        if consumed_previous {
            debug!("signing with the superseded proxy secret (one-shot)");
        }

        let signature = self
            .engine
            .execute(OpCode::SignBytes, &[secret.as_bytes(), bytes])
            .await?;

        // The one-shot removal and the state transition land in the same
        // record replacement.
        if consumed_previous {
            record.previous_proxy_key = None;
        }
        record.state = LifecycleState::LoneKey;
        self.commit(&mut ctl, record)?;

        Ok(signature)
    }

    fn ensure_usable(&self, ctl: &Controller) -> Result<(), ProxyError> {
        if ctl.inconsistent {
            return Err(ProxyError::InconsistentState);
        }
        Ok(())
    }

    /// Load the record from disk on first use, creating a fresh keyless one
    /// when the directory has never been used.
    fn load_record(&self, ctl: &mut Controller) -> Result<ProxyRecord, ProxyError> {
        if let Some(record) = &ctl.record {
            return Ok(record.clone());
        }
        let record = match self.store.load()? {
            Some(record) => record,
            None => {
                let record = ProxyRecord::fresh();
                info!(tag = %record.tag, "creating configuration record");
                self.store.store(&record)?;
                record
            }
        };
        ctl.record = Some(record.clone());
        Ok(record)
    }

    /// Persist a transitioned record. A failure here means the module has
    /// already acted while the host's view did not change, so the controller
    /// latches instead of pretending the operation never happened.
    fn commit(&self, ctl: &mut Controller, record: ProxyRecord) -> Result<(), ProxyError> {
        if let Err(err) = self.store.store(&record) {
            error!("state transition could not be persisted: {err}");
            ctl.inconsistent = true;
            return Err(ProxyError::InconsistentState);
        }
        ctl.record = Some(record);
        Ok(())
    }
}

fn invalid_state(op: OpCode, state: LifecycleState) -> ProxyError {
    ProxyError::InvalidState {
        operation: op.name(),
        state: state.name(),
    }
}
