//! BLE Connection Module
//!
//! Owns the link to one heater: scan, open with retry and backoff,
//! disconnect, and tracking of unexpected drops.

use crate::domain::models::{ConnectionState, LinkEvent};
use crate::infrastructure::bluetooth::transport::{DisconnectNotifier, Transport, TransportError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to scan for the device
    pub scan_timeout: Duration,
    /// Bound on each open attempt, and on every read/write
    pub timeout: Duration,
    /// Maximum open attempts per connect
    pub max_retries: u32,
    /// Delay before the second attempt; doubled for each attempt after that
    pub retry_delay: Duration,
    /// Upper bound for the backoff delay
    pub max_retry_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            max_retries: 20,
            retry_delay: Duration::from_millis(250),
            max_retry_delay: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("device {address} not found within {timeout:?}")]
    DeviceNotFound { address: String, timeout: Duration },
    #[error("failed to connect to {address} after {attempts} attempts: {source}")]
    LinkFailure {
        address: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("scan for {address} failed: {source}")]
    Scan {
        address: String,
        #[source]
        source: TransportError,
    },
    #[error("no device address configured")]
    NoTarget,
}

/// An unexpected drop, as handed to the registered callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub address: String,
}

type DisconnectCallback = Box<dyn Fn(&DisconnectEvent) + Send + Sync>;

/// Owns the transport link to one heater
pub struct ConnectionManager<T: Transport> {
    transport: T,
    config: ConnectionConfig,
    state: ConnectionState,
    address: Option<String>,
    handle: Option<T::Handle>,
    link: Option<T::Link>,
    link_id: u64,
    event_sender: mpsc::UnboundedSender<LinkEvent>,
    event_receiver: mpsc::UnboundedReceiver<LinkEvent>,
    on_disconnect: Option<DisconnectCallback>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, config: ConnectionConfig) -> Self {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        Self {
            transport,
            config,
            state: ConnectionState::Disconnected,
            address: None,
            handle: None,
            link: None,
            link_id: 0,
            event_sender,
            event_receiver,
            on_disconnect: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Register the callback run when the link drops on its own.
    /// Replaces any earlier registration.
    pub fn on_unexpected_disconnect<F>(&mut self, callback: F)
    where
        F: Fn(&DisconnectEvent) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Box::new(callback));
    }

    /// Scan for `address` and open a link to it, retrying the open up to
    /// `max_retries` times. The scan is bounded by `timeout` as well as the
    /// configured scan timeout.
    pub async fn connect(
        &mut self,
        address: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<(), ConnectError> {
        self.process_events();

        if self.is_connected() && self.address.as_deref() == Some(address) {
            debug!("Already connected to {}", address);
            return Ok(());
        }
        if self.link.is_some() {
            self.disconnect().await;
        }

        self.config.timeout = timeout;
        self.config.max_retries = max_retries;
        self.address = Some(address.to_string());
        self.handle = None;

        info!("Scanning for heater: {}", address);
        let scan_timeout = self.config.scan_timeout.min(timeout);
        let scan = self.transport.scan(address, scan_timeout);
        let handle = match tokio::time::timeout(scan_timeout, scan).await {
            Ok(Ok(Some(handle))) => handle,
            Ok(Ok(None)) | Err(_) => {
                error!("Device not found at address: {}", address);
                return Err(ConnectError::DeviceNotFound {
                    address: address.to_string(),
                    timeout: scan_timeout,
                });
            }
            Ok(Err(source)) => {
                error!("Scan for {} failed: {}", address, source);
                return Err(ConnectError::Scan {
                    address: address.to_string(),
                    source,
                });
            }
        };

        debug!("Resolved {} to {:?}", address, handle);
        self.handle = Some(handle);
        self.open_with_retry().await
    }

    /// Make sure a link is up, reconnecting with the stored parameters if needed
    pub async fn ensure_connected(&mut self) -> Result<(), ConnectError> {
        self.process_events();

        if self.is_connected() {
            return Ok(());
        }

        let address = self.address.clone().ok_or(ConnectError::NoTarget)?;
        if self.handle.is_some() {
            info!("Reconnecting to heater: {}", address);
            self.open_with_retry().await
        } else {
            let (timeout, max_retries) = (self.config.timeout, self.config.max_retries);
            self.connect(&address, timeout, max_retries).await
        }
    }

    /// Close the link if one is held
    pub async fn disconnect(&mut self) {
        self.process_events();

        let Some(link) = self.link.take() else {
            self.state = ConnectionState::Disconnected;
            return;
        };

        self.state = ConnectionState::Disconnecting;
        let address = self.address.clone().unwrap_or_default();
        match tokio::time::timeout(self.config.timeout, self.transport.close(link)).await {
            Ok(Ok(())) => info!("Disconnected from heater: {}", address),
            Ok(Err(e)) => warn!("Error while disconnecting from {}: {}", address, e),
            Err(_) => warn!("Timed out disconnecting from {}", address),
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Write to a characteristic on the current link
    pub async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        self.process_events();
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;

        let result = match tokio::time::timeout(
            self.config.timeout,
            self.transport.write(link, characteristic, data),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.config.timeout)),
        };
        self.check_link(result)
    }

    /// Read a characteristic on the current link
    pub async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        self.process_events();
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;

        let result = match tokio::time::timeout(
            self.config.timeout,
            self.transport.read(link, characteristic),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.config.timeout)),
        };
        self.check_link(result)
    }

    /// Apply link events posted by the transport since the last call
    pub fn process_events(&mut self) {
        while let Ok(event) = self.event_receiver.try_recv() {
            match event {
                LinkEvent::Disconnected { link_id, address } => {
                    if link_id != self.link_id || self.link.is_none() {
                        debug!("Ignoring stale disconnect event for link {}", link_id);
                        continue;
                    }
                    self.mark_dropped(address);
                }
            }
        }
    }

    async fn open_with_retry(&mut self) -> Result<(), ConnectError> {
        let address = self.address.clone().ok_or(ConnectError::NoTarget)?;
        let Some(handle) = self.handle.clone() else {
            return Err(ConnectError::NoTarget);
        };

        let max_attempts = self.config.max_retries.max(1);
        let timeout = self.config.timeout;
        let mut last_error = TransportError::NotConnected;

        for attempt in 1..=max_attempts {
            self.state = ConnectionState::Connecting;
            self.link_id += 1;
            let notifier =
                DisconnectNotifier::new(self.link_id, address.clone(), self.event_sender.clone());

            match tokio::time::timeout(timeout, self.transport.open(&handle, notifier)).await {
                Ok(Ok(link)) => {
                    self.link = Some(link);
                    self.state = ConnectionState::Connected;
                    info!("Connected to heater: {} (attempt {})", address, attempt);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt, max_attempts, address, e
                    );
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        "Connection attempt {}/{} to {} timed out after {:?}",
                        attempt, max_attempts, address, timeout
                    );
                    last_error = TransportError::Timeout(timeout);
                }
            }

            if attempt < max_attempts {
                let delay = self.config.backoff(attempt);
                debug!("Retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }

        self.state = ConnectionState::Disconnected;
        error!("Failed to connect to heater {}: {}", address, last_error);
        Err(ConnectError::LinkFailure {
            address,
            attempts: max_attempts,
            source: last_error,
        })
    }

    /// A transport reporting the link is gone means it is gone
    fn check_link<R>(&mut self, result: Result<R, TransportError>) -> Result<R, TransportError> {
        if let Err(TransportError::NotConnected) = &result {
            let address = self.address.clone().unwrap_or_default();
            self.mark_dropped(address);
        }
        result
    }

    fn mark_dropped(&mut self, address: String) {
        if self.link.take().is_none() {
            return;
        }
        self.state = ConnectionState::Disconnected;
        warn!("Unexpected disconnect from heater {}", address);
        if let Some(callback) = &self.on_disconnect {
            callback(&DisconnectEvent { address });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{Call, MockTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            scan_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff() {
        let config = config();
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(10), Duration::from_secs(1));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_open_succeeds() {
        let transport = MockTransport::new(ADDRESS);
        transport.fail_opens(2);
        let mut manager = ConnectionManager::new(transport.clone(), config());

        manager.connect(ADDRESS, Duration::from_secs(5), 3).await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.open_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_budget() {
        let transport = MockTransport::new(ADDRESS);
        transport.fail_opens(5);
        let mut manager = ConnectionManager::new(transport.clone(), config());

        let err = manager.connect(ADDRESS, Duration::from_secs(5), 3).await.unwrap_err();

        assert!(matches!(err, ConnectError::LinkFailure { attempts: 3, .. }));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.open_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_counts_as_failed_attempt() {
        let transport = MockTransport::new(ADDRESS);
        transport.hang_opens(1);
        let mut manager = ConnectionManager::new(transport.clone(), config());

        manager.connect(ADDRESS, Duration::from_secs(2), 3).await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(transport.open_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_not_found_when_scan_hangs() {
        let transport = MockTransport::new(ADDRESS);
        transport.hang_scans();
        let mut manager = ConnectionManager::new(transport.clone(), config());

        let err = manager.connect(ADDRESS, Duration::from_secs(5), 3).await.unwrap_err();

        assert!(matches!(err, ConnectError::DeviceNotFound { .. }));
        assert_eq!(transport.open_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_bounded_by_connect_timeout() {
        let transport = MockTransport::new(ADDRESS);
        transport.hang_scans();
        let mut manager = ConnectionManager::new(transport.clone(), ConnectionConfig::default());

        let started = tokio::time::Instant::now();
        let err = manager.connect(ADDRESS, Duration::from_secs(1), 3).await.unwrap_err();

        assert!(started.elapsed() <= Duration::from_secs(1));
        match err {
            ConnectError::DeviceNotFound { timeout, .. } => {
                assert_eq!(timeout, Duration::from_secs(1))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.open_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_not_found_for_unknown_address() {
        let transport = MockTransport::new(ADDRESS);
        let mut manager = ConnectionManager::new(transport.clone(), config());

        let err = manager
            .connect("11:22:33:44:55:66", Duration::from_secs(5), 3)
            .await
            .unwrap_err();

        assert!(matches!(err, ConnectError::DeviceNotFound { .. }));
        assert_eq!(transport.open_attempts(), 0);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_link_once() {
        let transport = MockTransport::new(ADDRESS);
        let mut manager = ConnectionManager::new(transport.clone(), config());

        manager.connect(ADDRESS, Duration::from_secs(5), 3).await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let closes = transport.calls().iter().filter(|c| matches!(c, Call::Close)).count();
        assert_eq!(closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connected_is_idempotent() {
        let transport = MockTransport::new(ADDRESS);
        let mut manager = ConnectionManager::new(transport.clone(), config());

        assert!(matches!(
            manager.ensure_connected().await,
            Err(ConnectError::NoTarget)
        ));

        manager.connect(ADDRESS, Duration::from_secs(5), 3).await.unwrap();
        manager.ensure_connected().await.unwrap();
        manager.ensure_connected().await.unwrap();

        assert_eq!(transport.open_attempts(), 1);
        assert_eq!(transport.scans(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_disconnect_triggers_reconnect() {
        let transport = MockTransport::new(ADDRESS);
        let mut manager = ConnectionManager::new(transport.clone(), config());
        let drops = Arc::new(AtomicUsize::new(0));
        let counter = drops.clone();
        manager.on_unexpected_disconnect(move |event| {
            assert_eq!(event.address, ADDRESS);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.connect(ADDRESS, Duration::from_secs(5), 3).await.unwrap();
        assert!(transport.drop_link());

        manager.process_events();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        manager.ensure_connected().await.unwrap();
        assert!(manager.is_connected());
        assert_eq!(transport.open_attempts(), 2);
        // The resolved handle is reused
        assert_eq!(transport.scans(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_disconnect_event_is_ignored() {
        let transport = MockTransport::new(ADDRESS);
        let mut manager = ConnectionManager::new(transport.clone(), config());

        manager.connect(ADDRESS, Duration::from_secs(5), 3).await.unwrap();
        let stale = transport.last_notifier().unwrap();
        manager.disconnect().await;
        manager.connect(ADDRESS, Duration::from_secs(5), 3).await.unwrap();

        assert!(stale.notify_disconnected());
        manager.process_events();
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_requires_link() {
        let transport = MockTransport::new(ADDRESS);
        let mut manager = ConnectionManager::new(transport.clone(), config());

        assert!(matches!(
            manager.write(Uuid::nil(), &[1]).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            manager.read(Uuid::nil()).await,
            Err(TransportError::NotConnected)
        ));
    }
}
