//! Connection management
//!
//! Drives a transport through framing, decoding and correlation, and
//! delivers the results to the record sink.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use super::{
    decode, encode_command, Command, CommandCategory, Correlator, FrameCodec, FramingStats,
    PendingResponse, PidSettings, ProtocolError, Record, Resolution, Transport,
};
use crate::sink::{EngineEvent, Origin, RecordSink};

/// Size of a single transport read
const READ_CHUNK_SIZE: usize = 4096;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Connected and streaming
    Connected,
    /// Torn down after a fatal error; reconnect to continue
    Error,
}

/// Live link to a sensor unit
pub struct Connection {
    transport: Box<dyn Transport>,
    codec: FrameCodec,
    correlator: Arc<Correlator>,
    sink: RecordSink,
    state: ConnectionState,
    read_buf: Vec<u8>,
    /// Metrics: cumulative bytes/records
    tx_bytes: u64,
    rx_bytes: u64,
    rx_records: u64,
    decode_errors: u64,
}

impl Connection {
    /// Wrap an open transport
    pub fn new(
        transport: Box<dyn Transport>,
        correlator: Arc<Correlator>,
        sink: RecordSink,
        receive_buffer_limit: usize,
    ) -> Self {
        sink.publish(EngineEvent::Connection(ConnectionState::Connected));
        info!("Live connection established");

        Self {
            transport,
            codec: FrameCodec::with_limit(receive_buffer_limit),
            correlator,
            sink,
            state: ConnectionState::Connected,
            read_buf: vec![0u8; READ_CHUNK_SIZE],
            tx_bytes: 0,
            rx_bytes: 0,
            rx_records: 0,
            decode_errors: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the link is usable
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Framing diagnostics
    pub fn framing_stats(&self) -> FramingStats {
        self.codec.stats()
    }

    /// Records that failed to decode
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    /// Cumulative (tx bytes, rx bytes, rx records)
    pub fn traffic(&self) -> (u64, u64, u64) {
        (self.tx_bytes, self.rx_bytes, self.rx_records)
    }

    /// Perform one transport read and process what arrived.
    ///
    /// Returns the number of records decoded. A fatal error tears the
    /// connection down before it is returned.
    pub fn poll(&mut self) -> Result<usize, ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }

        let n = match self.transport.read(&mut self.read_buf) {
            Ok(n) => n,
            Err(e) => {
                self.fail(&format!("read failed: {e}"));
                return Err(e.into());
            }
        };
        if n == 0 {
            return Ok(0);
        }

        let chunk = self.read_buf[..n].to_vec();
        self.process(&chunk)
    }

    /// Feed received bytes through the codec and decoder
    pub fn process(&mut self, bytes: &[u8]) -> Result<usize, ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        self.rx_bytes += bytes.len() as u64;
        trace!(len = bytes.len(), "Received bytes");

        let frames = match self.codec.feed(bytes) {
            Ok(frames) => frames,
            Err(e) => {
                self.fail(&e.to_string());
                return Err(e);
            }
        };

        let mut decoded = 0;
        for frame in frames {
            match decode(&frame) {
                Ok(record) => {
                    decoded += 1;
                    self.rx_records += 1;
                    self.dispatch(record);
                }
                Err(e) => {
                    self.decode_errors += 1;
                    warn!("Dropping record: {}", e);
                    self.sink.warn(Origin::Live, e.to_string());
                }
            }
        }
        Ok(decoded)
    }

    fn dispatch(&self, record: Record) {
        match record {
            Record::DataSample(sample) => self.sink.deliver_sample(Arc::new(sample), Origin::Live),
            response => match self.correlator.resolve(response) {
                Resolution::Delivered(category) => debug!(?category, "Response matched request"),
                Resolution::Unsolicited(record) => {
                    debug!(opcode = record.opcode(), "Unsolicited response");
                    self.sink.deliver_response(record, Origin::Live);
                }
            },
        }
    }

    fn write_command(&mut self, command: &Command) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        let bytes = encode_command(command)?;
        if let Err(e) = self.transport.write_all(&bytes) {
            self.fail(&format!("write failed: {e}"));
            return Err(e.into());
        }
        self.tx_bytes += bytes.len() as u64;
        debug!(opcode = command.opcode(), len = bytes.len(), "Command sent");
        Ok(())
    }

    fn request(
        &mut self,
        command: Command,
        category: CommandCategory,
    ) -> Result<PendingResponse, ProtocolError> {
        self.write_command(&command)?;
        Ok(self.correlator.register(category))
    }

    /// Send any command. Returns a pending response if the command is answered.
    pub fn send(&mut self, command: &Command) -> Result<Option<PendingResponse>, ProtocolError> {
        self.write_command(command)?;
        Ok(command
            .expected_response()
            .map(|category| self.correlator.register(category)))
    }

    /// Read a calibration map
    pub fn request_map(&mut self, map_id: u8) -> Result<PendingResponse, ProtocolError> {
        self.request(Command::RequestMap { map_id }, CommandCategory::Map(map_id))
    }

    /// Overwrite a calibration map; answered with an ack
    pub fn write_map(
        &mut self,
        map_id: u8,
        values: Vec<i16>,
    ) -> Result<PendingResponse, ProtocolError> {
        let command = Command::WriteMap { map_id, values };
        let category = CommandCategory::Ack(command.opcode());
        self.request(command, category)
    }

    /// Read PID settings of a controller channel
    pub fn request_settings(&mut self, channel: u8) -> Result<PendingResponse, ProtocolError> {
        self.request(
            Command::RequestSettings { channel },
            CommandCategory::Settings(channel),
        )
    }

    /// Overwrite PID settings of a controller channel; answered with an ack
    pub fn write_settings(
        &mut self,
        channel: u8,
        settings: PidSettings,
    ) -> Result<PendingResponse, ProtocolError> {
        let command = Command::WriteSettings { channel, settings };
        let category = CommandCategory::Ack(command.opcode());
        self.request(command, category)
    }

    /// Reload all settings from the unit's EEPROM
    pub fn load_from_persistent_store(&mut self) -> Result<PendingResponse, ProtocolError> {
        let command = Command::LoadFromEeprom;
        let category = CommandCategory::Ack(command.opcode());
        self.request(command, category)
    }

    /// Persist all settings to the unit's EEPROM
    pub fn save_to_persistent_store(&mut self) -> Result<PendingResponse, ProtocolError> {
        let command = Command::SaveToEeprom;
        let category = CommandCategory::Ack(command.opcode());
        self.request(command, category)
    }

    /// Close the transport. Outstanding requests fail with `Closed`.
    pub fn close(&mut self) {
        self.shutdown(ConnectionState::Disconnected);
    }

    fn fail(&mut self, reason: &str) {
        error!("Connection failed: {}", reason);
        self.shutdown(ConnectionState::Error);
    }

    fn shutdown(&mut self, state: ConnectionState) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if let Err(e) = self.transport.close() {
            warn!("Error closing transport: {}", e);
        }
        self.codec.reset();
        self.correlator.clear();
        self.state = state;
        self.sink.publish(EngineEvent::Connection(state));
        info!(?state, "Live connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
