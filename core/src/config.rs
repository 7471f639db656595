// Proxy configuration
//
// Cross-platform defaults: the record directory lives under the user's home
// directory (~/.bali), the advertised device name is "ArmorD", and transport
// behavior (scan timeout, retry budget) matches the device firmware's
// expectations.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ProxyError;

/// Default peripheral name advertised by the security module.
pub const DEFAULT_DEVICE_NAME: &str = "ArmorD";

/// Default scan timeout in milliseconds.
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 1000;

/// Default number of attempts for one logical request.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Directory holding the persisted configuration record.
    pub directory: PathBuf,

    /// Diagnostic verbosity (0 = errors only, 3 = full tracing).
    pub debug_level: u8,

    /// Advertised local name of the peripheral to connect to.
    pub device_name: String,

    /// How long a scan may run before failing with PeripheralNotFound.
    pub scan_timeout_ms: u64,

    /// Attempt budget for one request/response exchange.
    pub max_attempts: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            debug_level: 0,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            scan_timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record directory.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Set the diagnostic verbosity (clamped to 0..=3).
    pub fn with_debug_level(mut self, level: u8) -> Self {
        self.debug_level = level.min(3);
        self
    }

    /// Set the expected peripheral name.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the scan timeout in milliseconds.
    pub fn with_scan_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.scan_timeout_ms = timeout_ms;
        self
    }

    /// Set the attempt budget for one request.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.device_name.is_empty() {
            return Err(ProxyError::InvalidConfig(
                "device name cannot be empty".to_string(),
            ));
        }
        if self.scan_timeout_ms == 0 {
            return Err(ProxyError::InvalidConfig(
                "scan timeout must be > 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ProxyError::InvalidConfig(
                "attempt budget must be >= 1".to_string(),
            ));
        }
        if self.debug_level > 3 {
            return Err(ProxyError::InvalidConfig(
                "debug level must be 0..=3".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bali")
}
