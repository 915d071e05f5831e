//! Protocol errors

use thiserror::Error;

/// Errors that end a live connection or a transport operation
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The serial port could not be opened or configured
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// No live link is open
    #[error("Not connected to sensor unit")]
    NotConnected,

    /// The receive buffer hit its limit without yielding a frame
    #[error("Receive buffer exhausted ({buffered} bytes buffered, limit {limit})")]
    BufferExhausted {
        /// Bytes that would have been buffered
        buffered: usize,
        /// Configured limit
        limit: usize,
    },

    /// Payload is empty or larger than a frame can carry
    #[error("Command payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Command arguments the unit cannot accept
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The transport was closed underneath the connection
    #[error("Transport closed")]
    Closed,

    /// Transport read or write failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Recoverable framing faults. The codec resynchronizes after each of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Payload checksum does not match
    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        /// CRC computed over the received payload
        expected: u32,
        /// CRC carried in the frame
        actual: u32,
    },

    /// Declared length is zero or above the payload maximum
    #[error("Implausible frame length {0}")]
    BadLength(usize),

    /// The byte after the CRC is not the end delimiter
    #[error("Missing end delimiter (found {0:#04x})")]
    BadEndDelimiter(u8),
}

/// Recoverable payload decoding faults. The offending record is dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// First payload byte is not a known record opcode
    #[error("Unknown record type {0:#04x}")]
    UnknownType(u8),

    /// Payload length does not match the record layout
    #[error("Truncated payload for record {opcode:#04x}: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Record opcode
        opcode: u8,
        /// Length the layout requires
        expected: usize,
        /// Length received
        actual: usize,
    },

    /// A field holds a value outside its valid range
    #[error("Field '{field}' out of range: {value}")]
    OutOfRange {
        /// Field or channel name
        field: &'static str,
        /// Offending value
        value: f64,
    },
}
