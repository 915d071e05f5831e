//! Log playback
//!
//! Re-delivers recorded samples through the record sink with their
//! original spacing, scaled by a speed factor. Playback runs on a tokio
//! task; control calls only flip shared state and never block.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::DataSample;
use crate::sink::{EngineEvent, Origin, RecordSink};

/// Slowest accepted replay speed
pub const MIN_SPEED: f64 = 0.05;
/// Fastest accepted replay speed
pub const MAX_SPEED: f64 = 100.0;

/// Replay state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayStatus {
    /// No replay task
    Idle,
    /// Delivering samples
    Playing,
    /// Holding at a record boundary
    Paused,
    /// Winding down after a stop or the last sample
    Stopped,
}

impl ReplayStatus {
    /// Whether a replay task is running
    pub fn is_active(self) -> bool {
        !matches!(self, ReplayStatus::Idle)
    }
}

/// Replay errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    /// A replay is already running or winding down
    #[error("Replay already active")]
    AlreadyActive,

    /// The data set is empty
    #[error("Nothing to replay")]
    EmptySource,

    /// Start index is not inside the data set
    #[error("Start index {start} past end of data ({len} samples)")]
    StartPastEnd {
        /// Requested start index
        start: usize,
        /// Samples available
        len: usize,
    },

    /// Speed is not a positive finite number
    #[error("Invalid replay speed {0}")]
    InvalidSpeed(f64),

    /// Called outside a tokio runtime
    #[error("Replay needs a tokio runtime")]
    NoRuntime,
}

struct Shared {
    status: watch::Sender<ReplayStatus>,
    /// f64 bits
    speed: AtomicU64,
    position: AtomicUsize,
}

impl Shared {
    fn speed(&self) -> f64 {
        f64::from_bits(self.speed.load(Ordering::Acquire))
    }

    fn status(&self) -> ReplayStatus {
        *self.status.borrow()
    }
}

/// Validate a replay speed and clamp it to the supported range
fn checked_speed(speed: f64) -> Result<f64, ReplayError> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(ReplayError::InvalidSpeed(speed));
    }
    Ok(speed.clamp(MIN_SPEED, MAX_SPEED))
}

/// Real-time delay between two samples at `speed`
pub fn scaled_delay(previous_ms: u32, current_ms: u32, speed: f64) -> Duration {
    let gap = current_ms.saturating_sub(previous_ms) as f64;
    Duration::from_secs_f64(gap / 1000.0 / speed)
}

/// Replay engine
pub struct ReplayEngine {
    shared: Arc<Shared>,
    sink: RecordSink,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplayEngine {
    /// Create an idle engine delivering into `sink`
    pub fn new(sink: RecordSink) -> Self {
        let (status, _) = watch::channel(ReplayStatus::Idle);
        Self {
            shared: Arc::new(Shared {
                status,
                speed: AtomicU64::new(1.0f64.to_bits()),
                position: AtomicUsize::new(0),
            }),
            sink,
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Current state
    pub fn status(&self) -> ReplayStatus {
        self.shared.status()
    }

    /// Watch state changes
    pub fn watch(&self) -> watch::Receiver<ReplayStatus> {
        self.shared.status.subscribe()
    }

    /// Current speed factor
    pub fn speed(&self) -> f64 {
        self.shared.speed()
    }

    /// Change the speed. Takes effect at the next inter-record delay.
    pub fn set_speed(&self, speed: f64) -> Result<(), ReplayError> {
        let speed = checked_speed(speed)?;
        self.shared.speed.store(speed.to_bits(), Ordering::Release);
        debug!(speed, "Replay speed changed");
        Ok(())
    }

    /// Index of the next sample to deliver
    pub fn position(&self) -> usize {
        self.shared.position.load(Ordering::Acquire)
    }

    /// Start replaying `source` from `from_index`
    pub fn start(
        &self,
        source: Vec<Arc<DataSample>>,
        from_index: usize,
        speed: f64,
    ) -> Result<(), ReplayError> {
        if source.is_empty() {
            return Err(ReplayError::EmptySource);
        }
        if from_index >= source.len() {
            return Err(ReplayError::StartPastEnd {
                start: from_index,
                len: source.len(),
            });
        }
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| ReplayError::NoRuntime)?;
        let speed = checked_speed(speed)?;

        // Held until the token is stored so a concurrent stop() cancels this task
        let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        let claimed = self.shared.status.send_if_modified(|status| {
            if *status == ReplayStatus::Idle {
                *status = ReplayStatus::Playing;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ReplayError::AlreadyActive);
        }

        let token = CancellationToken::new();
        *cancel = Some(token.clone());
        self.shared.speed.store(speed.to_bits(), Ordering::Release);
        self.shared.position.store(from_index, Ordering::Release);
        self.sink.publish(EngineEvent::Replay(ReplayStatus::Playing));
        info!(
            from = from_index,
            total = source.len(),
            speed = self.speed(),
            "Replay started"
        );

        let task = handle.spawn(run(
            Arc::clone(&self.shared),
            self.sink.clone(),
            source,
            from_index,
            token,
        ));
        drop(cancel);

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    /// Hold delivery at the next record boundary
    pub fn pause(&self) -> bool {
        self.transition(ReplayStatus::Playing, ReplayStatus::Paused)
    }

    /// Continue after a pause
    pub fn resume(&self) -> bool {
        self.transition(ReplayStatus::Paused, ReplayStatus::Playing)
    }

    fn transition(&self, from: ReplayStatus, to: ReplayStatus) -> bool {
        let changed = self.shared.status.send_if_modified(|status| {
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(?to, "Replay state changed");
            self.sink.publish(EngineEvent::Replay(to));
        }
        changed
    }

    /// Stop replay. The task winds down and returns to `Idle`.
    pub fn stop(&self) {
        let stopped = self.shared.status.send_if_modified(|status| {
            if matches!(status, ReplayStatus::Playing | ReplayStatus::Paused) {
                *status = ReplayStatus::Stopped;
                true
            } else {
                false
            }
        });
        if let Some(token) = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
        if stopped {
            info!(position = self.position(), "Replay stopped");
        }
    }

    /// Wait until replay is idle again
    pub async fn finished(&self) {
        let mut rx = self.watch();
        let _ = rx.wait_for(|status| *status == ReplayStatus::Idle).await;
    }
}

impl Drop for ReplayEngine {
    fn drop(&mut self) {
        self.stop();
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    sink: RecordSink,
    source: Vec<Arc<DataSample>>,
    from: usize,
    cancel: CancellationToken,
) {
    let mut status = shared.status.subscribe();
    let mut previous: Option<u32> = None;

    for (index, sample) in source.iter().enumerate().skip(from) {
        if let Some(previous) = previous {
            let delay = scaled_delay(previous, sample.timestamp_ms, shared.speed());
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        if !hold_while_paused(&mut status, &cancel).await {
            break;
        }

        shared.position.store(index + 1, Ordering::Release);
        sink.deliver_sample(Arc::clone(sample), Origin::Replay);
        previous = Some(sample.timestamp_ms);
    }

    shared.status.send_replace(ReplayStatus::Stopped);
    sink.publish(EngineEvent::Replay(ReplayStatus::Stopped));
    shared.status.send_replace(ReplayStatus::Idle);
    sink.publish(EngineEvent::Replay(ReplayStatus::Idle));
    debug!(
        position = shared.position.load(Ordering::Acquire),
        "Replay task finished"
    );
}

/// Returns `false` if replay was stopped while waiting
async fn hold_while_paused(
    status: &mut watch::Receiver<ReplayStatus>,
    cancel: &CancellationToken,
) -> bool {
    loop {
        match *status.borrow_and_update() {
            ReplayStatus::Playing => return true,
            ReplayStatus::Paused => {}
            ReplayStatus::Idle | ReplayStatus::Stopped => return false,
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = status.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalog::DataStore;

    fn engine() -> ReplayEngine {
        ReplayEngine::new(RecordSink::new(Arc::new(DataStore::new()), 64))
    }

    fn source(timestamps: &[u32]) -> Vec<Arc<DataSample>> {
        timestamps
            .iter()
            .map(|&ts| Arc::new(DataSample::new(ts, vec![])))
            .collect()
    }

    #[test]
    fn test_scaled_delay() {
        assert_eq!(scaled_delay(0, 1000, 2.0), Duration::from_millis(500));
        assert_eq!(scaled_delay(1000, 1500, 0.5), Duration::from_secs(1));
        // Timestamp regression at a session boundary
        assert_eq!(scaled_delay(1000, 10, 1.0), Duration::ZERO);
    }

    #[test]
    fn test_speed_validation() {
        let replay = engine();
        assert_eq!(replay.set_speed(0.0), Err(ReplayError::InvalidSpeed(0.0)));
        assert!(replay.set_speed(f64::NAN).is_err());
        replay.set_speed(1000.0).unwrap();
        assert_eq!(replay.speed(), MAX_SPEED);
    }

    #[test]
    fn test_start_requires_runtime() {
        let replay = engine();
        assert_eq!(
            replay.start(source(&[0, 10]), 0, 1.0),
            Err(ReplayError::NoRuntime)
        );
        assert_eq!(replay.status(), ReplayStatus::Idle);
    }

    #[tokio::test]
    async fn test_start_validation() {
        let replay = engine();
        assert_eq!(
            replay.start(Vec::new(), 0, 1.0),
            Err(ReplayError::EmptySource)
        );
        assert_eq!(
            replay.start(source(&[0, 10]), 2, 1.0),
            Err(ReplayError::StartPastEnd { start: 2, len: 2 })
        );
        assert!(!replay.pause());
    }
}
