//! Engine lifecycle events
//!
//! Task and circuit transitions are published on a broadcast channel. Hosts
//! subscribe with [`EventBus::subscribe`]; a slow subscriber lags and misses
//! events rather than slowing the pool down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::reliability::CircuitState;

const DEFAULT_CAPACITY: usize = 256;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEventKind {
    /// No worker was idle; the task joined the backlog
    TaskQueued { task_id: Uuid, queue_len: usize },

    /// A worker picked the task up
    TaskStarted {
        task_id: Uuid,
        worker_id: u64,
        command: String,
    },

    /// The process exited with a code
    TaskCompleted {
        task_id: Uuid,
        exit_code: i32,
        duration_ms: u64,
    },

    /// The process could not be run to completion
    TaskFailed {
        task_id: Uuid,
        error: String,
        duration_ms: u64,
    },

    /// The task was removed from the queue before it ran
    TaskCancelled { task_id: Uuid },

    /// The circuit breaker changed state
    CircuitTransition { from: CircuitState, to: CircuitState },
}

/// An event with its timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EngineEventKind,
}

/// Fan-out of engine events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, kind: EngineEventKind) {
        let _ = self.tx.send(EngineEvent {
            at: Utc::now(),
            kind,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
