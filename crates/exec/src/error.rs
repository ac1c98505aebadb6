//! Error types for the execution engine

use std::time::Duration;

use thiserror::Error;

use crate::reliability::CircuitOpenError;
use crate::validator::ValidationError;

/// Errors returned by the pool and the engine
///
/// Every submitted task resolves to exactly one `TaskOutput` or one of these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    /// Command or arguments failed the injection check
    #[error("command rejected: {0}")]
    InjectionRejected(#[from] ValidationError),

    /// The backlog reached its configured maximum
    #[error("task queue is full ({max_queue_size} tasks waiting)")]
    QueueFull { max_queue_size: usize },

    /// Shutdown has begun; no new work is accepted
    #[error("process pool is shutting down")]
    PoolShuttingDown,

    /// The process outlived its timeout and was killed
    #[error("process timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    /// The OS refused to create the process
    #[error("failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    /// The process exited without an exit code (killed by a signal)
    #[error("process terminated abnormally{}", .signal.map(|s| format!(" by signal {s}")).unwrap_or_default())]
    Terminated { signal: Option<i32> },

    /// Removed from the queue, or killed by a pool-wide teardown
    #[error("task cancelled")]
    Cancelled,

    /// The circuit breaker refused the call without attempting it
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Requested pool size is below one
    #[error("invalid pool size: {0} (must be at least 1)")]
    InvalidPoolSize(usize),
}

impl ExecError {
    /// Whether this outcome says something about the health of the executable.
    ///
    /// Only attempted runs that failed count; rejections that happen before a
    /// process is created (validation, backpressure, cancellation, open circuit)
    /// do not.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed { .. } | Self::Terminated { .. } | Self::Timeout { .. }
        )
    }
}
