// Persistent key-lifecycle record and its on-disk store
//
// Exactly one record exists per proxy instance, stored as a single JSON file
// in the configured directory. The file is the source of truth for the key
// lifecycle: no state transition counts until it has been replaced on disk.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ProxyError;

/// Protocol version spoken by this proxy.
pub const PROTOCOL: &str = "v2";

/// Length of a proxy secret in bytes.
pub const SECRET_LEN: usize = 32;

/// Length of the instance tag in bytes (rendered as 32 hex chars).
pub const TAG_LEN: usize = 16;

/// Key-lifecycle states. The record invariants are:
/// keyless ⇔ no keys, loneKey ⇔ current key only, twoKeys ⇔ current key plus
/// the superseded key awaiting its one-shot signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    #[serde(rename = "keyless")]
    Keyless,
    #[serde(rename = "loneKey")]
    LoneKey,
    #[serde(rename = "twoKeys")]
    TwoKeys,
}

impl LifecycleState {
    /// Protocol-level name, used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            LifecycleState::Keyless => "keyless",
            LifecycleState::LoneKey => "loneKey",
            LifecycleState::TwoKeys => "twoKeys",
        }
    }
}

/// A 32-byte host-side secret bound into every privileged request.
///
/// The bytes are wiped when the value is dropped, and the Debug form never
/// prints them.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ProxySecret([u8; SECRET_LEN]);

impl ProxySecret {
    /// Generate a fresh random secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ProxySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProxySecret(..)")
    }
}

impl Serialize for ProxySecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ProxySecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let decoded = hex::decode(&text).map_err(D::Error::custom)?;
        let bytes: [u8; SECRET_LEN] = decoded
            .try_into()
            .map_err(|_| D::Error::custom("proxy secret must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// The persisted configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRecord {
    /// Stable identity for this security module instance, assigned once on
    /// first load and never mutated.
    pub tag: String,
    pub state: LifecycleState,
    #[serde(rename = "proxyKey", default, skip_serializing_if = "Option::is_none")]
    pub proxy_key: Option<ProxySecret>,
    #[serde(
        rename = "previousProxyKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub previous_proxy_key: Option<ProxySecret>,
}

impl ProxyRecord {
    /// Create a fresh keyless record with a new random tag.
    pub fn fresh() -> Self {
        let mut tag = [0u8; TAG_LEN];
        rand::rngs::OsRng.fill_bytes(&mut tag);
        Self {
            tag: hex::encode(tag),
            state: LifecycleState::Keyless,
            proxy_key: None,
            previous_proxy_key: None,
        }
    }

    /// Check the state/key presence invariants.
    pub fn is_consistent(&self) -> bool {
        match self.state {
            LifecycleState::Keyless => {
                self.proxy_key.is_none() && self.previous_proxy_key.is_none()
            }
            LifecycleState::LoneKey => {
                self.proxy_key.is_some() && self.previous_proxy_key.is_none()
            }
            LifecycleState::TwoKeys => {
                self.proxy_key.is_some() && self.previous_proxy_key.is_some()
            }
        }
    }
}

/// Durable, atomic storage for the configuration record.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write never leaves a partial record behind.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(directory: &Path) -> Self {
        Self {
            path: directory.join(format!("HSMProxy{PROTOCOL}.json")),
        }
    }

    /// Path of the record file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record, or `None` if no file exists yet.
    pub fn load(&self) -> Result<Option<ProxyRecord>, ProxyError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.failure("read", err)),
        };
        let record: ProxyRecord = serde_json::from_str(&contents)
            .map_err(|err| self.failure("parse", err))?;
        if !record.is_consistent() {
            return Err(ProxyError::ConfigStore(format!(
                "record {} violates the {} state invariants",
                self.path.display(),
                record.state.name()
            )));
        }
        Ok(Some(record))
    }

    /// Atomically replace the record on disk.
    pub fn store(&self, record: &ProxyRecord) -> Result<(), ProxyError> {
        if let Some(directory) = self.path.parent() {
            fs::create_dir_all(directory).map_err(|err| self.failure("prepare", err))?;
        }
        let contents = serde_json::to_string_pretty(record)
            .map_err(|err| self.failure("serialize", err))?;
        let staged = self.path.with_extension("json.tmp");
        fs::write(&staged, contents).map_err(|err| self.failure("stage", err))?;
        fs::rename(&staged, &self.path).map_err(|err| self.failure("replace", err))?;
        Ok(())
    }

    /// Remove the record. Removing an absent record is not an error.
    pub fn delete(&self) -> Result<(), ProxyError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.failure("delete", err)),
        }
    }

    fn failure(&self, action: &str, err: impl fmt::Display) -> ProxyError {
        ProxyError::ConfigStore(format!("{action} {}: {err}", self.path.display()))
    }
}
