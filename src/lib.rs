//! Control client for HCalory diesel heaters over Bluetooth LE.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{ConnectionState, HeaterState, TelemetryFrame};
pub use infrastructure::bluetooth::{
    BtleTransport, Command, ConnectError, ConnectionConfig, ConnectionManager, HeaterSession,
    SessionConfig, SessionError, WorkflowResult,
};
