//! Record sink
//!
//! Single delivery point for decoded records, whether they come from the
//! live link or from replay. Live samples are appended to the data store;
//! everything is published on a broadcast channel for subscribers.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::datalog::{DataStore, ReplayStatus};
use crate::protocol::{ConnectionState, DataSample, Record};

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Where a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Received from the sensor unit
    Live,
    /// Re-delivered by the replay engine
    Replay,
    /// Read from a capture file
    Capture,
}

impl Origin {
    /// Whether the record is being replayed
    pub fn is_replay(self) -> bool {
        self == Origin::Replay
    }
}

/// Events published to subscribers
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A data sample
    Sample {
        /// The sample
        sample: Arc<DataSample>,
        /// Live link or replay
        origin: Origin,
    },
    /// A response nobody was waiting for
    Response {
        /// The response record
        record: Record,
        /// Live link or replay
        origin: Origin,
    },
    /// A recoverable problem (decode error, skipped record)
    Warning {
        /// Where the problem was found
        origin: Origin,
        /// Human readable description
        message: String,
    },
    /// Live link state change
    Connection(ConnectionState),
    /// Replay state change
    Replay(ReplayStatus),
}

/// Cloneable handle delivering records to the store and subscribers
#[derive(Clone)]
pub struct RecordSink {
    store: Arc<DataStore>,
    events: broadcast::Sender<EngineEvent>,
}

impl RecordSink {
    /// Create a sink over `store` with an event channel of `capacity`
    pub fn new(store: Arc<DataStore>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { store, events }
    }

    /// Subscribe to events. Slow subscribers lag rather than block delivery.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The backing store
    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Deliver a sample. Live samples are recorded; replayed ones already are.
    pub fn deliver_sample(&self, sample: Arc<DataSample>, origin: Origin) {
        if origin == Origin::Live {
            self.store.append_shared(Arc::clone(&sample));
        }
        trace!(ts = sample.timestamp_ms, ?origin, "Sample delivered");
        self.publish(EngineEvent::Sample { sample, origin });
    }

    /// Deliver an unsolicited response
    pub fn deliver_response(&self, record: Record, origin: Origin) {
        self.publish(EngineEvent::Response { record, origin });
    }

    /// Report a recoverable problem
    pub fn warn(&self, origin: Origin, message: impl Into<String>) {
        self.publish(EngineEvent::Warning {
            origin,
            message: message.into(),
        });
    }
}
