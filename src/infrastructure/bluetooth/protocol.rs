//! HCalory Heater Protocol
//!
//! Command frames written to the heater and the telemetry frame read back from it.

use crate::domain::models::{HeaterState, TelemetryFrame};
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

/// Write Characteristic UUID - where command frames are sent
pub const WRITE_CHAR_UUID: &str = "0000fff2-0000-1000-8000-00805f9b34fb";

/// Read Characteristic UUID - where the telemetry frame is read from
pub const READ_CHAR_UUID: &str = "0000fff1-0000-1000-8000-00805f9b34fb";

pub const WRITE_CHAR: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);
pub const READ_CHAR: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);

/// Header shared by every command frame
pub const COMMAND_HEADER: [u8; 20] = [
    0x00, 0x02, 0x00, 0x01, 0x00, 0x01, 0x00, 0x0e, 0x04, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

pub const COMMAND_FRAME_LEN: usize = COMMAND_HEADER.len() + 2;

/// Minimum size of a telemetry frame. Anything after this is ignored.
pub const TELEMETRY_FRAME_LEN: usize = 28;

const fn command_frame(suffix: [u8; 2]) -> [u8; COMMAND_FRAME_LEN] {
    let mut frame = [0u8; COMMAND_FRAME_LEN];
    let mut i = 0;
    while i < COMMAND_HEADER.len() {
        frame[i] = COMMAND_HEADER[i];
        i += 1;
    }
    frame[COMMAND_HEADER.len()] = suffix[0];
    frame[COMMAND_HEADER.len() + 1] = suffix[1];
    frame
}

static STOP_HEAT: [u8; COMMAND_FRAME_LEN] = command_frame([0x01, 0x0e]);
static START_HEAT: [u8; COMMAND_FRAME_LEN] = command_frame([0x02, 0x0f]);
static UP: [u8; COMMAND_FRAME_LEN] = command_frame([0x03, 0x10]);
static DOWN: [u8; COMMAND_FRAME_LEN] = command_frame([0x04, 0x11]);
static GEAR: [u8; COMMAND_FRAME_LEN] = command_frame([0x07, 0x14]);
static THERMOSTAT: [u8; COMMAND_FRAME_LEN] = command_frame([0x06, 0x13]);
static PUMP_DATA: [u8; COMMAND_FRAME_LEN] = command_frame([0x00, 0x0d]);

/// Heater control commands
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    clap::ValueEnum,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[value(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Command {
    /// Stop heating and start the cooldown cycle
    StopHeat,
    /// Start the ignition sequence
    StartHeat,
    /// Raise the current setting
    Up,
    /// Lower the current setting
    Down,
    /// Switch to gear (power level) mode
    Gear,
    /// Switch to thermostat mode
    Thermostat,
    /// Ask the heater to refresh its telemetry frame
    PumpData,
}

impl Command {
    /// Get the raw frame for this command
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::StopHeat => &STOP_HEAT,
            Self::StartHeat => &START_HEAT,
            Self::Up => &UP,
            Self::Down => &DOWN,
            Self::Gear => &GEAR,
            Self::Thermostat => &THERMOSTAT,
            Self::PumpData => &PUMP_DATA,
        }
    }

    /// Whether the command changes heater state, as opposed to only refreshing telemetry
    pub fn is_actuating(&self) -> bool {
        !matches!(self, Self::PumpData)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("telemetry frame too short: got {actual} bytes, need {expected}")]
    UndersizedFrame { actual: usize, expected: usize },
}

/// Encode a command into the frame written to the heater
pub fn encode(command: Command) -> &'static [u8] {
    command.as_bytes()
}

/// Decode a telemetry frame read from the heater
///
/// # Telemetry Frame Structure (28 bytes, big-endian)
///
/// ```text
/// [0-19]  : Header (ignored)
/// [20]    : Heater state
/// [21]    : Heater mode
/// [22]    : Heater setting
/// [23]    : Voltage x10
/// [24-25] : Body temperature x10, hex digits
/// [26-27] : Ambient temperature x10, hex digits
/// ```
pub fn decode(raw: &[u8]) -> Result<TelemetryFrame, DecodeError> {
    if raw.len() < TELEMETRY_FRAME_LEN {
        return Err(DecodeError::UndersizedFrame {
            actual: raw.len(),
            expected: TELEMETRY_FRAME_LEN,
        });
    }

    trace!("Raw telemetry: {:02X?}", &raw[..TELEMETRY_FRAME_LEN]);

    let raw_voltage = raw[23];
    let raw_body_temperature = [raw[24], raw[25]];
    let raw_ambient_temperature = [raw[26], raw[27]];

    Ok(TelemetryFrame {
        heater_state: HeaterState::from_raw(raw[20]),
        heater_mode: raw[21],
        heater_setting: raw[22],
        voltage: raw_voltage / 10,
        body_temperature: decode_temperature(raw_body_temperature),
        ambient_temperature: decode_temperature(raw_ambient_temperature),
        raw_voltage,
        raw_body_temperature,
        raw_ambient_temperature,
    })
}

/// The firmware stores temperatures as the hex text of the byte pair, scaled by 10.
/// Keep the text round trip rather than reading a binary integer.
pub fn decode_temperature(raw: [u8; 2]) -> u16 {
    let digits = hex::encode(raw);
    // Two bytes always render as four hex digits
    u16::from_str_radix(&digits, 16).unwrap_or_default() / 10
}
