//! # MultiDisplay Core Library
//!
//! Core functionality for the MultiDisplay vehicle sensor display.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Framed serial protocol with CRC checking and resynchronization
//! - Sample and response record decoding
//! - Request/response correlation for device commands
//! - An append-only data store with a movable view window
//! - `.mdv2` capture files and CSV export
//! - Time-scaled replay of recorded data
//!
//! ## Example
//!
//! ```rust,ignore
//! use multidisplay_core::prelude::*;
//!
//! let mut engine = Engine::new(EngineConfig::default());
//! let mut events = engine.subscribe();
//!
//! engine.open_serial()?;
//! let map = engine.request_map(map_id::N75_DUTY)?;
//!
//! loop {
//!     engine.poll()?;
//!     while let Ok(EngineEvent::Sample { sample, .. }) = events.try_recv() {
//!         println!("RPM: {}", sample.rpm());
//!     }
//! }
//! ```

pub mod config;
pub mod datalog;
pub mod demo;
pub mod engine;
pub mod protocol;
pub mod sink;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{EngineConfig, SerialConfig};
    pub use crate::datalog::{DataStore, LoadReport, ReplayStatus, Viewport};
    pub use crate::demo::DemoSimulator;
    pub use crate::engine::Engine;
    pub use crate::protocol::commands::map_id;
    pub use crate::protocol::{
        Command, ConnectionState, DataSample, MapSensor, PendingResponse, PidSettings, Record,
        Transport,
    };
    pub use crate::sink::{EngineEvent, Origin};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
