//! Binary Protocol
//!
//! Implements the MultiDisplay binary telemetry protocol.
//!
//! Layers, from the wire up:
//! - [`FrameCodec`]: delimiter/length/CRC32 framing with resynchronization
//! - [`decode`] / [`encode_record`]: typed records on top of frame payloads
//! - [`Correlator`]: matches responses to outstanding requests
//! - [`Connection`]: drives a [`Transport`] through the layers above

pub mod channels;
pub mod commands;
mod connection;
pub mod correlator;
mod error;
mod frame;
pub mod record;
pub mod transport;

pub use channels::{ChannelDef, ChannelKind, MapSensor, CHANNELS};
pub use commands::{Command, CommandCategory};
pub use connection::{Connection, ConnectionState};
pub use correlator::{Correlator, PendingResponse, Resolution, ResponseError};
pub use error::{DecodeError, FrameError, ProtocolError};
pub use frame::{encode_command, encode_frame, Frame, FrameCodec, FramingStats};
pub use record::{decode, encode_record, DataSample, MapResponse, PidSettings, Record};
pub use transport::{SerialTransport, Transport};

/// Start-of-frame delimiter
pub const START_BYTE: u8 = 0xAA;

/// End-of-frame delimiter
pub const END_BYTE: u8 = 0x55;

/// Maximum payload size in bytes. Larger declared lengths are treated as corruption.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Bytes of framing around a payload: start, length (2), CRC32 (4), end
pub const FRAME_OVERHEAD: usize = 1 + 2 + 4 + 1;

/// Default baud rate of the sensor unit
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Default read timeout for the transport in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Default upper bound for the receive buffer before the connection is torn down
pub const DEFAULT_RECEIVE_BUFFER_LIMIT: usize = 1 << 20;
