// Transport seam between the request engine and the BLE stack
//
// The engine never touches btleplug directly; it drives these two traits.
// Platform implementations (and the in-process test device) provide them.

use async_trait::async_trait;

use crate::ProxyError;

/// A connected, subscribed, single-use link to the security module.
///
/// One `write_block` produces exactly one notification; the notification is
/// the response to that write. The link must be closed on every exit path —
/// a half-open connection leaves the peripheral unusable for the next
/// exchange.
#[async_trait]
pub trait HsmLink: Send {
    /// Write one block and await its notification payload.
    async fn write_block(&mut self, block: &[u8]) -> Result<Vec<u8>, ProxyError>;

    /// Disconnect from the peripheral.
    async fn close(&mut self) -> Result<(), ProxyError>;
}

/// Factory for links: owns peripheral discovery and connection setup.
#[async_trait]
pub trait HsmCentral: Send + Sync {
    /// Scan for the security module, connect, discover the UART service and
    /// its characteristics, subscribe to notifications, and hand back a
    /// ready-to-use link.
    async fn acquire(&self) -> Result<Box<dyn HsmLink>, ProxyError>;
}
