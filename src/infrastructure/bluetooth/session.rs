//! Heater Session Module
//!
//! Command/response protocol on top of a [`ConnectionManager`]: write a
//! command frame, pump and read telemetry, and the before/after workflow
//! used to confirm a command took effect.

use crate::domain::models::TelemetryFrame;
use crate::infrastructure::bluetooth::connection::{ConnectError, ConnectionManager};
use crate::infrastructure::bluetooth::protocol::{self, Command, DecodeError};
use crate::infrastructure::bluetooth::transport::{Transport, TransportError};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Session-level settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub write_characteristic: Uuid,
    pub read_characteristic: Uuid,
    /// Wait between an actuating command and the follow-up telemetry read
    pub settle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_characteristic: protocol::WRITE_CHAR,
            read_characteristic: protocol::READ_CHAR,
            settle_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("not connected to heater")]
    NotConnected,
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("failed to send command {command}: {source}")]
    CommandFailed {
        command: Command,
        #[source]
        source: TransportError,
    },
    #[error("failed to read telemetry: {0}")]
    ReadFailed(#[source] TransportError),
    #[error("failed to decode telemetry: {0}")]
    DecodeFailed(#[from] DecodeError),
}

/// Outcome of one operator action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WorkflowResult {
    /// Telemetry-only request
    Snapshot(TelemetryFrame),
    /// Telemetry before and after an actuating command
    Comparison {
        before: TelemetryFrame,
        after: TelemetryFrame,
    },
}

/// Talks to one heater through a connection manager
pub struct HeaterSession<T: Transport> {
    connection: ConnectionManager<T>,
    config: SessionConfig,
    drops: Arc<AtomicU32>,
}

impl<T: Transport> HeaterSession<T> {
    /// Takes over the manager's unexpected-disconnect callback
    pub fn new(mut connection: ConnectionManager<T>, config: SessionConfig) -> Self {
        let drops = Arc::new(AtomicU32::new(0));
        let counter = drops.clone();
        connection.on_unexpected_disconnect(move |event| {
            counter.fetch_add(1, Ordering::Relaxed);
            warn!("Lost heater {}; the next command reconnects", event.address);
        });
        Self {
            connection,
            config,
            drops,
        }
    }

    /// Links dropped by the heater rather than closed by us
    pub fn unexpected_disconnects(&self) -> u32 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager<T> {
        &mut self.connection
    }

    /// Write one command frame, reconnecting first if the link is down
    pub async fn send_command(&mut self, command: Command) -> Result<(), SessionError> {
        self.connection
            .ensure_connected()
            .await
            .map_err(|e| match e {
                ConnectError::NoTarget => SessionError::NotConnected,
                other => SessionError::Connect(other),
            })?;

        let frame = protocol::encode(command);
        debug!("Writing {} frame: {:02X?}", command, frame);

        match self
            .connection
            .write(self.config.write_characteristic, frame)
            .await
        {
            Ok(()) => {
                info!(
                    "Sent command {} to heater {}",
                    command,
                    self.connection.address().unwrap_or_default()
                );
                Ok(())
            }
            Err(source) => {
                error!("Failed to send command {}: {}", command, source);
                Err(SessionError::CommandFailed { command, source })
            }
        }
    }

    /// Ask the heater to refresh its telemetry, then read and decode it
    pub async fn fetch_telemetry(&mut self) -> Result<TelemetryFrame, SessionError> {
        self.send_command(Command::PumpData).await?;

        let raw = self
            .connection
            .read(self.config.read_characteristic)
            .await
            .map_err(|e| match e {
                TransportError::NotConnected => SessionError::NotConnected,
                other => SessionError::ReadFailed(other),
            })?;

        let data = protocol::decode(&raw)?;
        info!(
            "Received data: state={} mode={} setting={} voltage={} body={} ambient={}",
            data.heater_state,
            data.heater_mode,
            data.heater_setting,
            data.voltage,
            data.body_temperature,
            data.ambient_temperature
        );
        Ok(data)
    }

    /// Connect to `address`, take a snapshot, and for actuating commands
    /// send the command and take a second snapshot after the settle delay.
    ///
    /// The link is closed on every exit path.
    pub async fn run_workflow(
        &mut self,
        command: Command,
        address: &str,
    ) -> Result<WorkflowResult, SessionError> {
        let result = self.workflow(command, address).await;
        self.connection.disconnect().await;
        result
    }

    /// Close the link, if any
    pub async fn disconnect(&mut self) {
        self.connection.disconnect().await;
    }

    async fn workflow(
        &mut self,
        command: Command,
        address: &str,
    ) -> Result<WorkflowResult, SessionError> {
        let (timeout, max_retries) = {
            let config = self.connection.config();
            (config.timeout, config.max_retries)
        };
        self.connection
            .connect(address, timeout, max_retries)
            .await?;

        let before = self.fetch_telemetry().await?;
        if !command.is_actuating() {
            return Ok(WorkflowResult::Snapshot(before));
        }

        self.send_command(command).await?;
        tokio::time::sleep(self.config.settle_delay).await;
        let after = self.fetch_telemetry().await?;

        Ok(WorkflowResult::Comparison { before, after })
    }
}
