//! Request/response correlation
//!
//! Each outbound command that expects an answer registers a pending entry
//! keyed by its [`CommandCategory`]. A later request of the same category
//! replaces the earlier one, so a response never satisfies two requesters.
//! The correlator never times out on its own; callers pick a policy with
//! [`PendingResponse::wait_timeout`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use super::{CommandCategory, Record};

/// Why a pending request finished without a response
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    /// A newer request of the same category replaced this one
    #[error("Request superseded by a newer request of the same kind")]
    Superseded,

    /// The link went down first
    #[error("Connection closed before a response arrived")]
    Closed,

    /// The caller's deadline passed
    #[error("No response within {0:?}")]
    Timeout(Duration),
}

type Reply = Result<Record, ResponseError>;

struct PendingEntry {
    id: u64,
    tx: oneshot::Sender<Reply>,
}

/// Outcome of offering a received record to the correlator
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Handed to the requester waiting on this category
    Delivered(CommandCategory),
    /// Nobody asked for it
    Unsolicited(Record),
}

/// Handle to a response that has not arrived yet
#[derive(Debug)]
pub struct PendingResponse {
    id: u64,
    category: CommandCategory,
    rx: oneshot::Receiver<Reply>,
}

impl PendingResponse {
    /// Request id, unique per correlator
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Category this request waits on
    pub fn category(&self) -> CommandCategory {
        self.category
    }

    /// Wait for the response
    pub async fn wait(self) -> Result<Record, ResponseError> {
        self.rx.await.unwrap_or(Err(ResponseError::Closed))
    }

    /// Wait for the response, giving up after `timeout`
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Record, ResponseError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(reply) => reply.unwrap_or(Err(ResponseError::Closed)),
            Err(_) => Err(ResponseError::Timeout(timeout)),
        }
    }

    /// Poll without blocking. `Ok(None)` while the response is outstanding.
    pub fn try_take(&mut self) -> Result<Option<Record>, ResponseError> {
        match self.rx.try_recv() {
            Ok(reply) => reply.map(Some),
            Err(oneshot::error::TryRecvError::Empty) => Ok(None),
            Err(oneshot::error::TryRecvError::Closed) => Err(ResponseError::Closed),
        }
    }

    /// Block the current thread until the response arrives.
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_wait(self) -> Result<Record, ResponseError> {
        self.rx.blocking_recv().unwrap_or(Err(ResponseError::Closed))
    }
}

/// Pending request table, at most one entry per category
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<CommandCategory, PendingEntry>>,
    next_id: AtomicU64,
}

impl Correlator {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<CommandCategory, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request, superseding any unanswered request of the same category
    pub fn register(&self, category: CommandCategory) -> PendingResponse {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();

        if let Some(previous) = self.table().insert(category, PendingEntry { id, tx }) {
            debug!(?category, superseded = previous.id, by = id, "Request superseded");
            let _ = previous.tx.send(Err(ResponseError::Superseded));
        }

        PendingResponse { id, category, rx }
    }

    /// Offer a received record. Matching requests are resolved and removed.
    pub fn resolve(&self, record: Record) -> Resolution {
        let Some(category) = CommandCategory::for_record(&record) else {
            return Resolution::Unsolicited(record);
        };

        let Some(entry) = self.table().remove(&category) else {
            return Resolution::Unsolicited(record);
        };

        match entry.tx.send(Ok(record)) {
            Ok(()) => {
                debug!(?category, id = entry.id, "Response delivered");
                Resolution::Delivered(category)
            }
            // Requester stopped waiting; treat the response as unsolicited
            Err(returned) => returned.map_or(Resolution::Delivered(category), Resolution::Unsolicited),
        }
    }

    /// Whether a request of this category is outstanding
    pub fn is_pending(&self, category: CommandCategory) -> bool {
        self.table().contains_key(&category)
    }

    /// Id of the outstanding request of this category
    pub fn pending_id(&self, category: CommandCategory) -> Option<u64> {
        self.table().get(&category).map(|e| e.id)
    }

    /// Number of outstanding requests
    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    /// Fail every outstanding request with [`ResponseError::Closed`]
    pub fn clear(&self) {
        for (_, entry) in self.table().drain() {
            let _ = entry.tx.send(Err(ResponseError::Closed));
        }
    }
}
