//! Structured events emitted by the worker loop.
//!
//! Logs are for operators; events are for code. Tests, dashboards and the
//! CLI subscribe to the stream to observe completions and failures without
//! scraping log output. A slow subscriber lags and loses events; it never
//! blocks the worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::WorkId;

/// A structured event emitted by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkerStarted,
    WorkStarted {
        id: WorkId,
        work_kind: String,
        dependency: Option<String>,
    },
    WorkCompleted {
        id: WorkId,
        duration_ms: u64,
    },
    WorkFailed {
        id: WorkId,
        error: String,
        duration_ms: u64,
    },
    WorkPanicked {
        id: WorkId,
        message: String,
    },
    DrainStarted,
    ForcedStop {
        id: WorkId,
    },
    WorkDiscarded {
        count: usize,
    },
    WorkerStopped,
}

/// Fan-out of worker events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
