//! In-memory transport for tests

use crate::infrastructure::bluetooth::transport::{DisconnectNotifier, Transport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Scan,
    Open,
    Close,
    Write { characteristic: Uuid, data: Vec<u8> },
    Read { characteristic: Uuid },
}

#[derive(Default)]
struct State {
    scan_hangs: bool,
    open_failures: u32,
    open_hangs: u32,
    write_failures: u32,
    lose_link_after_write: bool,
    reads: VecDeque<Vec<u8>>,
    open_attempts: u32,
    connected: bool,
    calls: Vec<(Instant, Call)>,
    notifier: Option<DisconnectNotifier>,
}

/// Scriptable transport that records every call it receives
#[derive(Clone)]
pub struct MockTransport {
    address: String,
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: Call) {
        self.lock().calls.push((Instant::now(), call));
    }

    pub fn hang_scans(&self) {
        self.lock().scan_hangs = true;
    }

    pub fn fail_opens(&self, count: u32) {
        self.lock().open_failures = count;
    }

    pub fn hang_opens(&self, count: u32) {
        self.lock().open_hangs = count;
    }

    pub fn fail_writes(&self, count: u32) {
        self.lock().write_failures = count;
    }

    /// Lose the link silently right after the next successful write
    pub fn lose_link_after_write(&self) {
        self.lock().lose_link_after_write = true;
    }

    /// Queue a frame for the next read
    pub fn push_read(&self, frame: Vec<u8>) {
        self.lock().reads.push_back(frame);
    }

    pub fn open_attempts(&self) -> u32 {
        self.lock().open_attempts
    }

    pub fn scans(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Scan)).count()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.lock().calls.clone()
    }

    pub fn last_notifier(&self) -> Option<DisconnectNotifier> {
        self.lock().notifier.clone()
    }

    /// Drop the current link as if the heater went out of range
    pub fn drop_link(&self) -> bool {
        let notifier = {
            let mut state = self.lock();
            state.connected = false;
            state.notifier.clone()
        };
        notifier.map(|n| n.notify_disconnected()).unwrap_or(false)
    }
}

impl Transport for MockTransport {
    type Handle = String;
    type Link = u64;

    async fn scan(&self, address: &str, _timeout: Duration) -> Result<Option<String>, TransportError> {
        self.record(Call::Scan);
        let hangs = self.lock().scan_hangs;
        if hangs {
            std::future::pending::<()>().await;
        }
        Ok((address == self.address).then(|| address.to_string()))
    }

    async fn open(&self, _handle: &String, notifier: DisconnectNotifier) -> Result<u64, TransportError> {
        self.record(Call::Open);
        let hang = {
            let mut state = self.lock();
            state.open_attempts += 1;
            if state.open_hangs > 0 {
                state.open_hangs -= 1;
                true
            } else {
                false
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.lock();
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(TransportError::Link("connection refused".into()));
        }
        state.connected = true;
        let link_id = notifier.link_id();
        state.notifier = Some(notifier);
        Ok(link_id)
    }

    async fn close(&self, _link: u64) -> Result<(), TransportError> {
        self.record(Call::Close);
        self.lock().connected = false;
        Ok(())
    }

    async fn write(&self, _link: &u64, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        self.record(Call::Write {
            characteristic,
            data: data.to_vec(),
        });
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Err(TransportError::Link("write rejected".into()));
        }
        if state.lose_link_after_write {
            state.lose_link_after_write = false;
            state.connected = false;
        }
        Ok(())
    }

    async fn read(&self, _link: &u64, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        self.record(Call::Read { characteristic });
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state
            .reads
            .pop_front()
            .ok_or_else(|| TransportError::Link("nothing to read".into()))
    }
}
