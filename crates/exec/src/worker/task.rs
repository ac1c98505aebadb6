//! Task types: what callers submit and what they get back

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::duration_millis;
use crate::error::ExecError;

/// Per-invocation options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Directory the process starts in (inherits the host's when unset)
    pub working_directory: Option<PathBuf>,

    /// Kill the process after this long. `None` uses the pool default;
    /// `Some(Duration::ZERO)` disables the timeout.
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the timeout in milliseconds
    pub fn with_timeout_ms(self, millis: u64) -> Self {
        self.with_timeout(Duration::from_millis(millis))
    }
}

/// Result of a process that ran to exit.
///
/// A non-zero exit code is still a successful run; interpreting it is up to
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,
}

impl TaskOutput {
    /// Whether the process exited with code 0
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Everything needed to run one process
#[derive(Debug, Clone)]
pub(crate) struct TaskSpec {
    pub id: Uuid,
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    /// Zero means no timeout
    pub timeout: Duration,
}

pub(crate) type Completion = oneshot::Sender<Result<TaskOutput, ExecError>>;

/// A task that has not reached a worker yet.
///
/// Owns the only sender for its completion channel; [`complete`] consumes it,
/// so a task can resolve only once.
///
/// [`complete`]: QueuedTask::complete
pub(crate) struct QueuedTask {
    pub spec: TaskSpec,
    pub enqueued_at: Instant,
    completion: Completion,
}

impl QueuedTask {
    pub fn new(spec: TaskSpec) -> (Self, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle { id: spec.id, rx };
        let task = Self {
            spec,
            enqueued_at: Instant::now(),
            completion: tx,
        };
        (task, handle)
    }

    pub fn id(&self) -> Uuid {
        self.spec.id
    }

    /// Resolve the task. A dropped handle is not an error.
    pub fn complete(self, result: Result<TaskOutput, ExecError>) {
        let _ = self.completion.send(result);
    }

    pub fn into_parts(self) -> (TaskSpec, Completion) {
        (self.spec, self.completion)
    }
}

/// Handle to a submitted task
#[derive(Debug)]
pub struct TaskHandle {
    id: Uuid,
    rx: oneshot::Receiver<Result<TaskOutput, ExecError>>,
}

impl TaskHandle {
    /// Identifier usable with `cancel_task`
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the task to finish
    pub async fn wait(self) -> Result<TaskOutput, ExecError> {
        // The sender only disappears without a value if the pool itself was dropped
        self.rx.await.unwrap_or(Err(ExecError::Cancelled))
    }
}
