//! Engine configuration
//!
//! Persisted as JSON. Every field has a default so partial files load.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::datalog::DEFAULT_WINDOW_SIZE;
use crate::protocol::{
    MapSensor, DEFAULT_BAUD_RATE, DEFAULT_RECEIVE_BUFFER_LIMIT, DEFAULT_TIMEOUT_MS,
};
use crate::sink::DEFAULT_EVENT_CAPACITY;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// File is not valid configuration JSON
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name, e.g. `/dev/ttyUSB0` or `COM3`
    pub port_name: String,
    /// Line speed
    pub baud_rate: u32,
    /// Read timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl SerialConfig {
    /// Read timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Live link settings
    pub serial: SerialConfig,
    /// Records visible in the data window
    pub window_size: usize,
    /// Replay speed factor
    pub replay_speed: f64,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Most bytes the frame decoder may buffer before the link is dropped
    pub receive_buffer_limit: usize,
    /// Type-K thermocouples actually wired up (of 8)
    pub connected_thermocouples: usize,
    /// Digifant MAP sensor fitted
    pub map_sensor: MapSensor,
    /// Where captures are saved by default; documents directory if unset
    pub capture_dir: Option<PathBuf>,
    /// Timeout applied by callers that wait on responses
    pub response_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            window_size: DEFAULT_WINDOW_SIZE,
            replay_speed: 1.0,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            receive_buffer_limit: DEFAULT_RECEIVE_BUFFER_LIMIT,
            connected_thermocouples: 5,
            map_sensor: MapSensor::default(),
            capture_dir: None,
            response_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Response timeout, if callers should apply one
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }
}
