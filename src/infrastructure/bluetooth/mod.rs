//! Bluetooth Module
//!
//! Provides BLE communication with the HCalory heater.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     HeaterSession                        │
//! │   (command protocol - public API for the application)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌────────────┐  ┌───────────┐  ┌───────────┐
//! │ Connection │  │ Transport │  │ Protocol  │
//! │            │  │           │  │           │
//! │ - Retry    │  │ - Scanner │  │ - UUIDs   │
//! │ - Backoff  │  │ - GATT    │  │ - Commands│
//! │ - Drops    │  │   access  │  │ - Decoding│
//! └────────────┘  └───────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Command frames, telemetry decoding, characteristic UUIDs
//! - [`transport`] - The transport contract the connection layer relies on
//! - [`scanner`] - BLE device discovery
//! - [`adapter`] - btleplug implementation of the transport
//! - [`connection`] - Connection lifecycle with retry and backoff
//! - [`session`] - Command/response protocol and the before/after workflow

pub mod adapter;
pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main types for convenience
pub use adapter::BtleTransport;
pub use connection::{ConnectError, ConnectionConfig, ConnectionManager};
pub use protocol::Command;
pub use session::{HeaterSession, SessionConfig, SessionError, WorkflowResult};
