//! Engine context
//!
//! Owns the configuration, data store, correlator, replay engine and the
//! optional live connection. One engine per display session; the caller
//! drives the live link by calling [`Engine::poll`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::datalog::{
    default_capture_path, CaptureError, DataStore, LoadReport, ReplayEngine, ReplayError,
    ReplayStatus, Viewport,
};
use crate::protocol::{
    Command, Connection, ConnectionState, Correlator, PendingResponse, PidSettings, ProtocolError,
    SerialTransport, Transport,
};
use crate::sink::{EngineEvent, Origin, RecordSink};

/// Display session: live link, recorded data and replay
pub struct Engine {
    config: EngineConfig,
    store: Arc<DataStore>,
    correlator: Arc<Correlator>,
    sink: RecordSink,
    replay: ReplayEngine,
    connection: Option<Connection>,
}

impl Engine {
    /// Create an engine with an empty data store
    pub fn new(config: EngineConfig) -> Self {
        let store = Arc::new(DataStore::with_window_size(config.window_size));
        let sink = RecordSink::new(Arc::clone(&store), config.event_capacity);
        let replay = ReplayEngine::new(sink.clone());

        Self {
            config,
            store,
            correlator: Arc::new(Correlator::new()),
            sink,
            replay,
            connection: None,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Recorded data set
    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// Replay engine, for status watching and `finished().await`
    pub fn replay(&self) -> &ReplayEngine {
        &self.replay
    }

    /// Subscribe to samples, responses and state changes
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sink.subscribe()
    }

    // ------------------------------------------------------------------
    // Live link
    // ------------------------------------------------------------------

    /// Start a live session over `transport`. Any replay is stopped first.
    pub fn connect(&mut self, transport: Box<dyn Transport>) {
        self.replay.stop();
        self.disconnect();
        self.connection = Some(Connection::new(
            transport,
            Arc::clone(&self.correlator),
            self.sink.clone(),
            self.config.receive_buffer_limit,
        ));
    }

    /// Open the configured serial port and start a live session
    pub fn open_serial(&mut self) -> Result<(), ProtocolError> {
        let serial = &self.config.serial;
        let transport = SerialTransport::open(
            &serial.port_name,
            Some(serial.baud_rate),
            Some(serial.timeout()),
        )?;
        self.connect(Box::new(transport));
        Ok(())
    }

    /// Close the live session, failing outstanding requests
    pub fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }

    /// Live link state
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map_or(ConnectionState::Disconnected, Connection::state)
    }

    /// Whether the live link is up
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    fn live(&mut self) -> Result<&mut Connection, ProtocolError> {
        self.connection
            .as_mut()
            .filter(|c| c.is_connected())
            .ok_or(ProtocolError::NotConnected)
    }

    /// Read and process whatever the link has received.
    ///
    /// A fatal link error drops the connection; the error is returned once.
    pub fn poll(&mut self) -> Result<usize, ProtocolError> {
        let result = self.live()?.poll();
        if result.is_err() {
            warn!("Dropping failed live connection");
            self.connection = None;
        }
        result
    }

    /// Send any command
    pub fn send(&mut self, command: &Command) -> Result<Option<PendingResponse>, ProtocolError> {
        self.live()?.send(command)
    }

    /// Read a calibration map
    pub fn request_map(&mut self, map_id: u8) -> Result<PendingResponse, ProtocolError> {
        self.live()?.request_map(map_id)
    }

    /// Overwrite a calibration map; answered with an ack
    pub fn write_map(
        &mut self,
        map_id: u8,
        values: Vec<i16>,
    ) -> Result<PendingResponse, ProtocolError> {
        self.live()?.write_map(map_id, values)
    }

    /// Read PID settings of a controller channel
    pub fn request_settings(&mut self, channel: u8) -> Result<PendingResponse, ProtocolError> {
        self.live()?.request_settings(channel)
    }

    /// Overwrite PID settings; answered with an ack
    pub fn write_settings(
        &mut self,
        channel: u8,
        settings: PidSettings,
    ) -> Result<PendingResponse, ProtocolError> {
        self.live()?.write_settings(channel, settings)
    }

    /// Reload all settings from EEPROM
    pub fn load_from_persistent_store(&mut self) -> Result<PendingResponse, ProtocolError> {
        self.live()?.load_from_persistent_store()
    }

    /// Persist all settings to EEPROM
    pub fn save_to_persistent_store(&mut self) -> Result<PendingResponse, ProtocolError> {
        self.live()?.save_to_persistent_store()
    }

    // ------------------------------------------------------------------
    // Recorded data
    // ------------------------------------------------------------------

    /// Replace the data set with a capture file. The live link is closed first.
    pub fn open_capture<P: AsRef<Path>>(&mut self, path: P) -> Result<LoadReport, CaptureError> {
        self.replay.stop();
        self.disconnect();
        let report = self.store.load(path)?;
        for warning in &report.warnings {
            self.sink.warn(Origin::Capture, warning.to_string());
        }
        Ok(report)
    }

    /// Save the data set to `path`
    pub fn save_capture<P: AsRef<Path>>(&self, path: P) -> Result<(), CaptureError> {
        self.store.save(path)
    }

    /// Save under a timestamped name in the capture directory
    pub fn save_capture_default(&self) -> Result<PathBuf, CaptureError> {
        let path = default_capture_path(self.config.capture_dir.as_deref(), chrono::Local::now());
        self.store.save(&path)?;
        Ok(path)
    }

    /// Export the data set as CSV
    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> Result<(), CaptureError> {
        self.store.export_csv(path)
    }

    /// Drop all recorded data. The live link is closed first.
    pub fn clear(&mut self) {
        self.replay.stop();
        self.disconnect();
        self.store.clear();
    }

    /// Change the visible window size
    pub fn set_window_size(&mut self, size: usize) -> Viewport {
        self.config.window_size = size;
        self.store.resize_window(size)
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    /// Replay the data set, from the current window or from the beginning.
    ///
    /// The live link is closed first; replay and live never share the store.
    pub fn start_replay(&mut self, from_window: bool) -> Result<(), ReplayError> {
        if self.replay.status().is_active() {
            return Err(ReplayError::AlreadyActive);
        }
        self.disconnect();

        let from = if from_window {
            self.store.viewport().begin
        } else {
            0
        };
        self.replay
            .start(self.store.snapshot(), from, self.config.replay_speed)?;
        info!(from, "Replay of recorded data started");
        Ok(())
    }

    /// Change replay speed; also becomes the speed of later replays
    pub fn set_replay_speed(&mut self, speed: f64) -> Result<(), ReplayError> {
        self.replay.set_speed(speed)?;
        self.config.replay_speed = self.replay.speed();
        Ok(())
    }

    /// Pause replay. `false` if not playing.
    pub fn pause_replay(&self) -> bool {
        self.replay.pause()
    }

    /// Resume a paused replay
    pub fn resume_replay(&self) -> bool {
        self.replay.resume()
    }

    /// Stop replay
    pub fn stop_replay(&self) {
        self.replay.stop();
    }

    /// Current replay state
    pub fn replay_status(&self) -> ReplayStatus {
        self.replay.status()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.disconnect();
    }
}
