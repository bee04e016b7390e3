use serde::{Serialize, Serializer};
use std::fmt;

/// Operating state reported by the heater in byte 20 of a telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaterState {
    Off,
    Cooldown,
    CooldownStarting,
    CooldownReceived,
    IgnitionReceived,
    IgnitionStarting,
    Igniting,
    Running,
    Heating,
    Error,
    /// A state byte the firmware sent that we have no name for
    Unrecognized(u8),
}

impl HeaterState {
    /// Map a raw state byte. Never fails: unknown values are kept as `Unrecognized`.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Off,
            65 => Self::Cooldown,
            67 => Self::CooldownStarting,
            69 => Self::CooldownReceived,
            128 => Self::IgnitionReceived,
            129 => Self::IgnitionStarting,
            131 => Self::Igniting,
            133 => Self::Running,
            135 => Self::Heating,
            255 => Self::Error,
            other => Self::Unrecognized(other),
        }
    }

    pub fn raw(&self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Cooldown => 65,
            Self::CooldownStarting => 67,
            Self::CooldownReceived => 69,
            Self::IgnitionReceived => 128,
            Self::IgnitionStarting => 129,
            Self::Igniting => 131,
            Self::Running => 133,
            Self::Heating => 135,
            Self::Error => 255,
            Self::Unrecognized(raw) => *raw,
        }
    }

    /// Operator-facing name, or `None` for unrecognized values
    pub fn name(&self) -> Option<&'static str> {
        Some(match self {
            Self::Off => "off",
            Self::Cooldown => "cooldown",
            Self::CooldownStarting => "cooldown_starting",
            Self::CooldownReceived => "cooldown_received",
            Self::IgnitionReceived => "ignition_received",
            Self::IgnitionStarting => "ignition_starting",
            Self::Igniting => "igniting",
            Self::Running => "running",
            Self::Heating => "heating",
            Self::Error => "error",
            Self::Unrecognized(_) => return None,
        })
    }
}

impl fmt::Display for HeaterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.raw()),
        }
    }
}

// Known states serialize by name, unknown ones as the raw integer
impl Serialize for HeaterState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.name() {
            Some(name) => serializer.serialize_str(name),
            None => serializer.serialize_u8(self.raw()),
        }
    }
}

/// One decoded telemetry snapshot.
///
/// Raw fields are kept next to the derived values so a frame can be
/// compared or re-examined without going back to the wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryFrame {
    pub heater_state: HeaterState,
    pub heater_mode: u8,
    pub heater_setting: u8,
    pub voltage: u8,
    pub body_temperature: u16,
    pub ambient_temperature: u16,

    #[serde(skip)]
    pub raw_voltage: u8,
    #[serde(skip)]
    pub raw_body_temperature: [u8; 2],
    #[serde(skip)]
    pub raw_ambient_temperature: [u8; 2],
}

/// Lifecycle of the logical link to one heater
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Events a transport posts about an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The peripheral dropped the link without us asking
    Disconnected { link_id: u64, address: String },
}
