// ArmorD Core — BLE HSM Proxy
//
// The private signing key lives on the peripheral and never crosses the
// radio. This crate is the host's half of that arrangement: request framing,
// the BLE UART exchange, and the persisted key-lifecycle record that keeps
// the host and the module agreeing on which key is current.

pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod store;
pub mod transport;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::engine::RequestEngine;
use crate::lifecycle::KeyLifecycle;
use crate::store::ConfigStore;
use crate::transport::codec::flag_from_response;
use crate::transport::{BleCentral, HsmCentral};

pub use crate::config::ProxyConfig;
pub use crate::store::{LifecycleState, ProxyRecord, ProxySecret, PROTOCOL};
pub use crate::transport::{OpCode, UART_SERVICE_UUID};

/// Digest algorithm implemented by the security module.
pub const DIGEST_ALGORITHM: &str = "SHA512";

/// Signature algorithm implemented by the security module.
pub const SIGNATURE_ALGORITHM: &str = "ED25519";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{operation} is not permitted in the {state} state")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("configuration rejected: {0}")]
    InvalidConfig(String),

    #[error("no peripheral named {name} found within {timeout_ms} ms")]
    PeripheralNotFound { name: String, timeout_ms: u64 },

    #[error("peripheral does not expose the UART service")]
    ServiceMissing,

    #[error("UART service is missing its write or notify characteristic")]
    CharacteristicsMissing,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("device rejected a block with status code {0}")]
    BlockRejected(u8),

    #[error("request failed after {attempts} attempts")]
    RequestFailed {
        attempts: u32,
        #[source]
        cause: Box<ProxyError>,
    },

    #[error("argument {index} is {len} bytes; the wire limit is 65535")]
    ArgumentTooLarge { index: usize, len: usize },

    #[error("a request may carry at most 255 arguments, got {0}")]
    TooManyArguments(usize),

    #[error("config store failure: {0}")]
    ConfigStore(String),

    #[error("the module's key state no longer matches the persisted record; erase the keys to recover")]
    InconsistentState,

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

// ============================================================================
// PROXY FACADE
// ============================================================================

/// Host-side proxy to the ArmorD security module.
///
/// The module holds the private key; this proxy holds the matching proxy
/// secrets and the lifecycle record, and speaks the chunked UART protocol on
/// the host's behalf. One operation is in flight per proxy instance at a
/// time; overlapping calls queue in FIFO order.
pub struct HsmProxy {
    device_name: String,
    engine: Arc<RequestEngine>,
    controller: KeyLifecycle,
}

impl HsmProxy {
    /// Create a proxy that talks to real hardware over BLE.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        config.validate()?;
        init_tracing(config.debug_level);
        let central: Arc<dyn HsmCentral> = Arc::new(BleCentral::new(&config));
        Self::with_central(config, central)
    }

    /// Create a proxy with default configuration.
    pub fn with_defaults() -> Result<Self, ProxyError> {
        Self::new(ProxyConfig::default())
    }

    /// Create a proxy over a caller-supplied transport. This is the seam the
    /// tests use; it also allows embedding against a different central.
    pub fn with_central(
        config: ProxyConfig,
        central: Arc<dyn HsmCentral>,
    ) -> Result<Self, ProxyError> {
        config.validate()?;
        let engine = Arc::new(RequestEngine::new(central, config.max_attempts));
        let store = ConfigStore::new(&config.directory);
        let controller = KeyLifecycle::new(Arc::clone(&engine), store);
        Ok(Self {
            device_name: config.device_name,
            engine,
            controller,
        })
    }

    /// Protocol version spoken by this proxy.
    pub fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    /// Stable tag identifying this security module instance. Loads the
    /// persisted record, creating it on first use.
    pub async fn tag(&self) -> Result<String, ProxyError> {
        self.controller.tag().await
    }

    /// Current lifecycle state as persisted.
    pub async fn state(&self) -> Result<LifecycleState, ProxyError> {
        self.controller.current_state().await
    }

    // ------------------------------------------------------------------------
    // KEY LIFECYCLE
    // ------------------------------------------------------------------------

    /// Ask the module to generate its key pair. Returns the public key.
    pub async fn generate_keys(&self) -> Result<Vec<u8>, ProxyError> {
        self.controller.generate_keys().await
    }

    /// Supersede the current key pair, keeping the old secret around for one
    /// final signature. Returns the new public key.
    pub async fn rotate_keys(&self) -> Result<Vec<u8>, ProxyError> {
        self.controller.rotate_keys().await
    }

    /// Erase the module's keys and the persisted record.
    pub async fn erase_keys(&self) -> Result<bool, ProxyError> {
        self.controller.erase_keys().await
    }

    /// Sign `bytes` with the module's private key. After a rotation the very
    /// next signature comes from the superseded key, which is consumed by it.
    pub async fn sign_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>, ProxyError> {
        self.controller.sign_bytes(bytes).await
    }

    // ------------------------------------------------------------------------
    // STATELESS OPERATIONS
    // ------------------------------------------------------------------------

    /// SHA-512 digest of `bytes`, computed on the module.
    pub async fn digest_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>, ProxyError> {
        self.engine.execute(OpCode::DigestBytes, &[bytes]).await
    }

    /// Check a signature against a public key and the signed bytes.
    pub async fn valid_signature(
        &self,
        public_key: &[u8],
        signature: &[u8],
        bytes: &[u8],
    ) -> Result<bool, ProxyError> {
        let response = self
            .engine
            .execute(OpCode::ValidSignature, &[public_key, signature, bytes])
            .await?;
        Ok(flag_from_response(&response))
    }
}

impl fmt::Display for HsmProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} proxy {PROTOCOL} (digest: {DIGEST_ALGORITHM}, signature: {SIGNATURE_ALGORITHM})",
            self.device_name
        )
    }
}

/// Initialize tracing once; the configured debug level sets the default
/// filter, RUST_LOG overrides it, and diagnostics go to stderr.
fn init_tracing(debug_level: u8) {
    let default_filter = match debug_level {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let initialized = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();
    if initialized {
        debug!("tracing initialized at {default_filter}");
    }
}

// ============================================================================
// TESTS
// ============================================================================
