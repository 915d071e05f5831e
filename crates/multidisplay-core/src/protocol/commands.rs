//! Protocol commands
//!
//! Defines the commands understood by the MultiDisplay unit and which
//! response each of them is answered with.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use super::record::{write_i16s, PidSettings, Record, MAX_MAP_AXIS};
use super::ProtocolError;

/// Command opcodes (first payload byte of an outbound frame)
pub mod opcode {
    /// Button A held
    pub const BUTTON_A_HOLD: u8 = 0x10;
    /// Button A pushed
    pub const BUTTON_A_PUSH: u8 = 0x11;
    /// Button B held
    pub const BUTTON_B_HOLD: u8 = 0x12;
    /// Button B pushed
    pub const BUTTON_B_PUSH: u8 = 0x13;
    /// Start binary sample stream
    pub const ENABLE_BINARY_OUTPUT: u8 = 0x14;
    /// Stop sample stream
    pub const DISABLE_OUTPUT: u8 = 0x15;
    /// Zero the boost sensor
    pub const CALIBRATE_BOOST: u8 = 0x16;
    /// Reload all settings
    pub const LOAD_FROM_EEPROM: u8 = 0x17;
    /// Persist all settings
    pub const SAVE_TO_EEPROM: u8 = 0x18;
    /// Read a map
    pub const REQUEST_MAP: u8 = 0x20;
    /// Write a map
    pub const WRITE_MAP: u8 = 0x21;
    /// Reload N75 maps
    pub const LOAD_MAPS_FROM_EEPROM: u8 = 0x22;
    /// Persist N75 maps
    pub const SAVE_MAPS_TO_EEPROM: u8 = 0x23;
    /// Read PID settings
    pub const REQUEST_SETTINGS: u8 = 0x24;
    /// Write PID settings
    pub const WRITE_SETTINGS: u8 = 0x25;
    /// Reload PID settings
    pub const LOAD_SETTINGS_FROM_EEPROM: u8 = 0x26;
    /// Persist PID settings
    pub const SAVE_SETTINGS_TO_EEPROM: u8 = 0x27;
}

/// Well-known map identifiers
pub mod map_id {
    /// N75 wastegate valve duty cycle map
    pub const N75_DUTY: u8 = 0x01;
    /// Boost setpoint map
    pub const N75_SETPOINT: u8 = 0x02;
}

/// Most cells a single map write can carry
pub const MAX_MAP_CELLS: usize = MAX_MAP_AXIS * MAX_MAP_AXIS;

/// What a response answers. At most one request per category may be pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandCategory {
    /// Contents of the map with this id
    Map(u8),
    /// PID settings of this controller channel
    Settings(u8),
    /// Acknowledgement of the command with this opcode
    Ack(u8),
}

impl CommandCategory {
    /// The category a received record answers, if it answers anything
    pub fn for_record(record: &Record) -> Option<Self> {
        match record {
            Record::DataSample(_) => None,
            Record::Ack(code) => Some(CommandCategory::Ack(*code)),
            Record::MapResponse(map) => Some(CommandCategory::Map(map.map_id)),
            Record::SettingsResponse { channel, .. } => Some(CommandCategory::Settings(*channel)),
        }
    }
}

/// Commands sent to the sensor unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Front panel button A (hold or short push)
    ButtonA {
        /// Long press
        hold: bool,
    },
    /// Front panel button B (hold or short push)
    ButtonB {
        /// Long press
        hold: bool,
    },
    /// Start streaming binary data samples
    EnableBinaryOutput,
    /// Stop streaming data samples
    DisableOutput,
    /// Measure ambient pressure and zero the boost sensor
    CalibrateBoost,
    /// Reload all settings from EEPROM
    LoadFromEeprom,
    /// Persist all settings to EEPROM
    SaveToEeprom,
    /// Read a calibration map
    RequestMap {
        /// Map to read
        map_id: u8,
    },
    /// Overwrite the cells of a calibration map
    WriteMap {
        /// Map to write
        map_id: u8,
        /// Cells, row-major
        values: Vec<i16>,
    },
    /// Reload N75 maps from EEPROM
    LoadMapsFromEeprom,
    /// Persist N75 maps to EEPROM
    SaveMapsToEeprom,
    /// Read PID settings of a controller channel
    RequestSettings {
        /// Controller channel
        channel: u8,
    },
    /// Overwrite PID settings of a controller channel
    WriteSettings {
        /// Controller channel
        channel: u8,
        /// New settings
        settings: PidSettings,
    },
    /// Reload PID settings from EEPROM
    LoadSettingsFromEeprom,
    /// Persist PID settings to EEPROM
    SaveSettingsToEeprom,
}

impl Command {
    /// Opcode byte of this command
    pub fn opcode(&self) -> u8 {
        match self {
            Command::ButtonA { hold: true } => opcode::BUTTON_A_HOLD,
            Command::ButtonA { hold: false } => opcode::BUTTON_A_PUSH,
            Command::ButtonB { hold: true } => opcode::BUTTON_B_HOLD,
            Command::ButtonB { hold: false } => opcode::BUTTON_B_PUSH,
            Command::EnableBinaryOutput => opcode::ENABLE_BINARY_OUTPUT,
            Command::DisableOutput => opcode::DISABLE_OUTPUT,
            Command::CalibrateBoost => opcode::CALIBRATE_BOOST,
            Command::LoadFromEeprom => opcode::LOAD_FROM_EEPROM,
            Command::SaveToEeprom => opcode::SAVE_TO_EEPROM,
            Command::RequestMap { .. } => opcode::REQUEST_MAP,
            Command::WriteMap { .. } => opcode::WRITE_MAP,
            Command::LoadMapsFromEeprom => opcode::LOAD_MAPS_FROM_EEPROM,
            Command::SaveMapsToEeprom => opcode::SAVE_MAPS_TO_EEPROM,
            Command::RequestSettings { .. } => opcode::REQUEST_SETTINGS,
            Command::WriteSettings { .. } => opcode::WRITE_SETTINGS,
            Command::LoadSettingsFromEeprom => opcode::LOAD_SETTINGS_FROM_EEPROM,
            Command::SaveSettingsToEeprom => opcode::SAVE_SETTINGS_TO_EEPROM,
        }
    }

    /// Response category this command waits for, `None` for fire-and-forget
    pub fn expected_response(&self) -> Option<CommandCategory> {
        match self {
            Command::ButtonA { .. }
            | Command::ButtonB { .. }
            | Command::EnableBinaryOutput
            | Command::DisableOutput => None,
            Command::RequestMap { map_id } => Some(CommandCategory::Map(*map_id)),
            Command::RequestSettings { channel } => Some(CommandCategory::Settings(*channel)),
            _ => Some(CommandCategory::Ack(self.opcode())),
        }
    }

    /// Reject arguments the unit cannot accept
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Command::WriteMap { values, .. } if values.is_empty() || values.len() > MAX_MAP_CELLS => {
                Err(ProtocolError::InvalidCommand(format!(
                    "map write with {} cells (1..={} allowed)",
                    values.len(),
                    MAX_MAP_CELLS
                )))
            }
            _ => Ok(()),
        }
    }

    /// Frame payload (opcode + arguments). Call [`validate`](Self::validate) first.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = vec![self.opcode()];
        match self {
            Command::RequestMap { map_id } => out.push(*map_id),
            Command::WriteMap { map_id, values } => {
                out.push(*map_id);
                let mut count = [0u8; 2];
                BigEndian::write_u16(&mut count, values.len() as u16);
                out.extend_from_slice(&count);
                write_i16s(values, &mut out);
            }
            Command::RequestSettings { channel } => out.push(*channel),
            Command::WriteSettings { channel, settings } => {
                out.push(*channel);
                settings.write_to(&mut out);
            }
            _ => {}
        }
        out
    }
}
