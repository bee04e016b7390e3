//! BLE Transport Contract
//!
//! What the connection layer needs from a Bluetooth stack. The production
//! implementation is [`super::adapter::BtleTransport`].

use crate::domain::models::LinkEvent;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no Bluetooth adapter available")]
    NoAdapter,
    #[error("invalid device address: {0}")]
    InvalidAddress(String),
    #[error("characteristic {uuid} not found on device")]
    CharacteristicNotFound { uuid: Uuid },
    #[error("link is not connected")]
    NotConnected,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("link failure: {0}")]
    Link(String),
    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),
}

/// Hands a transport the means to report that a link dropped.
///
/// Every opened link gets its own notifier stamped with a generation id, so
/// late events from an earlier link can be told apart.
#[derive(Debug, Clone)]
pub struct DisconnectNotifier {
    link_id: u64,
    address: String,
    sender: mpsc::UnboundedSender<LinkEvent>,
}

impl DisconnectNotifier {
    pub fn new(link_id: u64, address: String, sender: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            link_id,
            address,
            sender,
        }
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Report an unexpected disconnect. Returns false once nobody is listening.
    pub fn notify_disconnected(&self) -> bool {
        self.sender
            .send(LinkEvent::Disconnected {
                link_id: self.link_id,
                address: self.address.clone(),
            })
            .is_ok()
    }
}

/// A Bluetooth stack able to find one peripheral and talk GATT to it
pub trait Transport {
    /// A resolved peripheral, cheap to clone and reusable for reconnects
    type Handle: Clone + Debug + Send + Sync;
    /// An open GATT link
    type Link: Send + Sync;

    /// Look for `address` for at most `timeout`
    fn scan(
        &self,
        address: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Self::Handle>, TransportError>> + Send;

    /// Open a link. Unexpected drops of this link must be reported through `notifier`.
    fn open(
        &self,
        handle: &Self::Handle,
        notifier: DisconnectNotifier,
    ) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;

    fn close(&self, link: Self::Link) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn write(
        &self,
        link: &Self::Link,
        characteristic: Uuid,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn read(
        &self,
        link: &Self::Link,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}
