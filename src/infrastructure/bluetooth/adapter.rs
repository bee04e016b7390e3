//! btleplug Transport
//!
//! [`Transport`] on top of the platform Bluetooth stack.

use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::transport::{DisconnectNotifier, Transport, TransportError};
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{Stream, StreamExt};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// Platform Bluetooth transport using the first available adapter
pub struct BtleTransport {
    adapter: Adapter,
    scanner: BleScanner,
}

impl BtleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;
        info!("Using Bluetooth adapter: {}", adapter.adapter_info().await?);

        Ok(Self {
            scanner: BleScanner::new(adapter.clone()),
            adapter,
        })
    }
}

/// An open GATT link. Disconnects itself when dropped without being closed.
pub struct BtleLink {
    peripheral: Option<Peripheral>,
    characteristics: BTreeSet<Characteristic>,
    watcher: JoinHandle<()>,
}

impl BtleLink {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::CharacteristicNotFound { uuid })
    }

    fn peripheral(&self) -> Result<&Peripheral, TransportError> {
        self.peripheral.as_ref().ok_or(TransportError::NotConnected)
    }
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        self.watcher.abort();
        if let Some(peripheral) = self.peripheral.take() {
            release_detached(peripheral);
        }
    }
}

/// Something that can be disconnected from a detached task
trait Release: Send + 'static {
    fn release(self) -> impl Future<Output = ()> + Send + 'static;
}

impl Release for Peripheral {
    async fn release(self) {
        if let Err(e) = self.disconnect().await {
            warn!("Failed to release BLE link: {}", e);
        }
    }
}

fn release_detached<P: Release>(peripheral: P) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            debug!("Releasing BLE link on drop");
            runtime.spawn(peripheral.release());
        }
        Err(_) => warn!("BLE link dropped outside a runtime; it may stay open"),
    }
}

/// Disconnects a half-opened peripheral unless disarmed once the link is built
struct ConnectGuard<P: Release> {
    peripheral: Option<P>,
}

impl<P: Release> ConnectGuard<P> {
    fn new(peripheral: P) -> Self {
        Self {
            peripheral: Some(peripheral),
        }
    }

    fn disarm(mut self) {
        self.peripheral = None;
    }
}

impl<P: Release> Drop for ConnectGuard<P> {
    fn drop(&mut self) {
        if let Some(peripheral) = self.peripheral.take() {
            release_detached(peripheral);
        }
    }
}

impl Transport for BtleTransport {
    type Handle = Peripheral;
    type Link = BtleLink;

    async fn scan(&self, address: &str, timeout: Duration) -> Result<Option<Peripheral>, TransportError> {
        self.scanner.find_by_address(address, timeout).await
    }

    async fn open(&self, handle: &Peripheral, notifier: DisconnectNotifier) -> Result<BtleLink, TransportError> {
        // Subscribe before connecting so a drop during setup is not missed
        let events = self.adapter.events().await?;

        // Held until the link exists, so a timed-out open cannot leave the peripheral connected
        let guard = ConnectGuard::new(handle.clone());
        if let Err(e) = handle.connect().await {
            guard.disarm();
            return Err(map_ble_error(e));
        }
        if let Err(e) = handle.discover_services().await {
            if let Err(close) = handle.disconnect().await {
                warn!("Failed to disconnect after service discovery error: {}", close);
            }
            guard.disarm();
            return Err(map_ble_error(e));
        }

        let characteristics = handle.characteristics();
        debug!("Discovered {} characteristics", characteristics.len());

        let watcher = tokio::spawn(watch_disconnects(events, handle.id(), notifier));
        guard.disarm();

        Ok(BtleLink {
            peripheral: Some(handle.clone()),
            characteristics,
            watcher,
        })
    }

    async fn close(&self, mut link: BtleLink) -> Result<(), TransportError> {
        // An explicit close is not an unexpected disconnect
        link.watcher.abort();
        match link.peripheral.take() {
            Some(peripheral) => peripheral.disconnect().await.map_err(map_ble_error),
            None => Ok(()),
        }
    }

    async fn write(&self, link: &BtleLink, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let target = link.characteristic(characteristic)?;
        link.peripheral()?
            .write(target, data, WriteType::WithResponse)
            .await
            .map_err(map_ble_error)
    }

    async fn read(&self, link: &BtleLink, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        let target = link.characteristic(characteristic)?;
        link.peripheral()?.read(target).await.map_err(map_ble_error)
    }
}

async fn watch_disconnects(mut events: EventStream, id: PeripheralId, notifier: DisconnectNotifier) {
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(dropped) = event {
            if dropped == id {
                notifier.notify_disconnected();
                return;
            }
        }
    }
}

fn map_ble_error(e: btleplug::Error) -> TransportError {
    match e {
        btleplug::Error::NotConnected => TransportError::NotConnected,
        other => TransportError::Ble(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    struct Tracked(oneshot::Sender<()>);

    impl Release for Tracked {
        async fn release(self) {
            let _ = self.0.send(());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_open_releases_peripheral() {
        let (released, was_released) = oneshot::channel();
        let open = async move {
            let guard = ConnectGuard::new(Tracked(released));
            // Service discovery that never finishes
            std::future::pending::<()>().await;
            guard.disarm();
        };

        assert!(tokio::time::timeout(Duration::from_secs(30), open).await.is_err());
        assert!(was_released.await.is_ok());
    }

    #[tokio::test]
    async fn test_disarmed_guard_keeps_link() {
        let (released, was_released) = oneshot::channel();
        ConnectGuard::new(Tracked(released)).disarm();

        // The sender is dropped without a release being sent
        assert!(was_released.await.is_err());
    }
}
