// BLE UART central
//
// Makes the ArmorD peripheral operable for one request, then releases it:
// scan by advertised service and local name, connect, discover the UART
// service and its write/notify characteristics, subscribe, exchange blocks
// write-by-write, disconnect. The underlying adapter is a process-wide
// singleton, so link acquisition is serialized and overlapping scans are
// never issued.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::transport::{HsmCentral, HsmLink};
use crate::ProxyError;

/// Nordic UART service advertised by the security module.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Host → device characteristic.
pub const UART_WRITE_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Device → host characteristic.
pub const UART_NOTIFY_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

fn ble_failure(context: &'static str) -> impl Fn(btleplug::Error) -> ProxyError {
    move |err| ProxyError::Transport(format!("{context}: {err}"))
}

/// btleplug-backed implementation of [`HsmCentral`].
pub struct BleCentral {
    device_name: String,
    scan_timeout: Duration,
    adapter_gate: Arc<Mutex<()>>,
}

impl BleCentral {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            device_name: config.device_name.clone(),
            scan_timeout: Duration::from_millis(config.scan_timeout_ms),
            adapter_gate: Arc::new(Mutex::new(())),
        }
    }

    async fn default_adapter() -> Result<Adapter, ProxyError> {
        let manager = Manager::new().await.map_err(ble_failure("manager"))?;
        manager
            .adapters()
            .await
            .map_err(ble_failure("adapters"))?
            .into_iter()
            .next()
            .ok_or_else(|| ProxyError::Transport("no Bluetooth adapter available".to_string()))
    }

    /// Scan until a peripheral advertising the UART service under the
    /// expected local name shows up, or the timeout elapses.
    async fn scan_for_peripheral(&self, adapter: &Adapter) -> Result<Peripheral, ProxyError> {
        let mut events = adapter.events().await.map_err(ble_failure("events"))?;
        adapter
            .start_scan(ScanFilter {
                services: vec![UART_SERVICE_UUID],
            })
            .await
            .map_err(ble_failure("start scan"))?;

        let found = tokio::time::timeout(
            self.scan_timeout,
            self.watch_for_device(adapter, &mut events),
        )
        .await;

        // The scan stops on every path, matched or not.
        if let Err(err) = adapter.stop_scan().await {
            warn!("failed to stop scan: {err}");
        }

        match found {
            Ok(result) => result,
            Err(_) => Err(ProxyError::PeripheralNotFound {
                name: self.device_name.clone(),
                timeout_ms: self.scan_timeout.as_millis() as u64,
            }),
        }
    }

    async fn watch_for_device(
        &self,
        adapter: &Adapter,
        events: &mut Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    ) -> Result<Peripheral, ProxyError> {
        while let Some(event) = events.next().await {
            // The local name can lag the discovery event by one advertising
            // report, so updates are inspected as well.
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let peripheral = adapter
                .peripheral(&id)
                .await
                .map_err(ble_failure("peripheral lookup"))?;
            let Some(properties) = peripheral
                .properties()
                .await
                .map_err(ble_failure("properties"))?
            else {
                continue;
            };
            if properties.local_name.as_deref() == Some(self.device_name.as_str()) {
                debug!("found {} ({id:?})", self.device_name);
                return Ok(peripheral);
            }
        }
        Err(ProxyError::Transport(
            "adapter event stream ended during scan".to_string(),
        ))
    }

    /// Discover the UART service on a connected peripheral and subscribe to
    /// its notify characteristic.
    async fn prepare_link(
        peripheral: &Peripheral,
    ) -> Result<(Characteristic, NotificationStream), ProxyError> {
        peripheral
            .discover_services()
            .await
            .map_err(ble_failure("service discovery"))?;

        let uart_services = peripheral
            .services()
            .iter()
            .filter(|service| service.uuid == UART_SERVICE_UUID)
            .count();
        if uart_services != 1 {
            return Err(ProxyError::ServiceMissing);
        }

        let characteristics = peripheral.characteristics();
        let write = characteristics
            .iter()
            .find(|c| c.uuid == UART_WRITE_UUID && c.service_uuid == UART_SERVICE_UUID)
            .cloned()
            .ok_or(ProxyError::CharacteristicsMissing)?;
        let notify = characteristics
            .iter()
            .find(|c| c.uuid == UART_NOTIFY_UUID && c.service_uuid == UART_SERVICE_UUID)
            .cloned()
            .ok_or(ProxyError::CharacteristicsMissing)?;

        peripheral
            .subscribe(&notify)
            .await
            .map_err(ble_failure("subscribe"))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(ble_failure("notifications"))?;

        Ok((write, notifications))
    }
}

#[async_trait]
impl HsmCentral for BleCentral {
    async fn acquire(&self) -> Result<Box<dyn HsmLink>, ProxyError> {
        let permit = Arc::clone(&self.adapter_gate).lock_owned().await;

        let adapter = Self::default_adapter().await?;
        let peripheral = self.scan_for_peripheral(&adapter).await?;

        peripheral.connect().await.map_err(ble_failure("connect"))?;

        match Self::prepare_link(&peripheral).await {
            Ok((write, notifications)) => Ok(Box::new(BleUartLink {
                peripheral,
                write,
                notifications,
                closed: false,
                permit: Some(permit),
            })),
            Err(err) => {
                if let Err(disconnect_err) = peripheral.disconnect().await {
                    warn!("failed to disconnect after setup error: {disconnect_err}");
                }
                Err(err)
            }
        }
    }
}

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

/// One connected exchange with the peripheral.
struct BleUartLink {
    peripheral: Peripheral,
    write: Characteristic,
    notifications: NotificationStream,
    closed: bool,
    permit: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl HsmLink for BleUartLink {
    async fn write_block(&mut self, block: &[u8]) -> Result<Vec<u8>, ProxyError> {
        self.peripheral
            .write(&self.write, block, WriteType::WithResponse)
            .await
            .map_err(ble_failure("write block"))?;

        while let Some(notification) = self.notifications.next().await {
            if notification.uuid == UART_NOTIFY_UUID {
                return Ok(notification.value);
            }
        }
        Err(ProxyError::Transport(
            "notification stream closed before a response arrived".to_string(),
        ))
    }

    async fn close(&mut self) -> Result<(), ProxyError> {
        self.closed = true;
        let result = self
            .peripheral
            .disconnect()
            .await
            .map_err(ble_failure("disconnect"));
        self.permit.take();
        result
    }
}

impl Drop for BleUartLink {
    fn drop(&mut self) {
        // Reached when the caller's future is cancelled mid-exchange: the
        // peripheral must still be disconnected, and the adapter stays locked
        // until that has happened.
        if self.closed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let peripheral = self.peripheral.clone();
            let permit = self.permit.take();
            handle.spawn(async move {
                if let Err(err) = peripheral.disconnect().await {
                    warn!("failed to disconnect dropped link: {err}");
                }
                drop(permit);
            });
        }
    }
}
