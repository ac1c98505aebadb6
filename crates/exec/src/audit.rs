//! Security audit records
//!
//! The pool reports security-relevant process events to an [`AuditSink`].
//! Recording is fire-and-forget: a sink must never block or fail execution.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A security-relevant event emitted by the execution engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// An invocation failed the injection check
    InjectionAttempt {
        command: String,
        args: Vec<String>,
        reason: String,
    },

    /// A process was created
    ProcessSpawn { command: String, pid: Option<u32> },

    /// A process exceeded its timeout and is being killed
    ProcessTimeout { command: String, timeout_ms: u64 },

    /// A process was killed outside its own timeout
    ProcessKill { command: String, reason: String },
}

impl AuditEvent {
    pub(crate) fn timeout(command: &str, timeout: Duration) -> Self {
        Self::ProcessTimeout {
            command: command.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Receiver of audit events.
///
/// Implementations should be fast; heavy work belongs on a background task.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `stagehand::audit` tracing target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match event {
            AuditEvent::InjectionAttempt {
                command,
                args,
                reason,
            } => {
                tracing::warn!(
                    target: "stagehand::audit",
                    %command,
                    ?args,
                    %reason,
                    "Rejected command injection attempt"
                );
            }
            AuditEvent::ProcessSpawn { command, pid } => {
                tracing::debug!(target: "stagehand::audit", %command, ?pid, "Process spawned");
            }
            AuditEvent::ProcessTimeout {
                command,
                timeout_ms,
            } => {
                tracing::warn!(target: "stagehand::audit", %command, timeout_ms, "Process timed out");
            }
            AuditEvent::ProcessKill { command, reason } => {
                tracing::warn!(target: "stagehand::audit", %command, %reason, "Process killed");
            }
        }
    }
}

/// Keeps every event in memory. Useful for tests and diagnostics.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
