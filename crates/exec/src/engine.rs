//! The execution engine: a process pool behind a circuit breaker
//!
//! [`Engine`] is what tool handlers hold. It is cheap to clone; every clone
//! drives the same pool and breaker. The owner of the process (usually the
//! binary's `main`) is responsible for calling [`Engine::shutdown`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::config::EngineConfig;
use crate::error::ExecError;
use crate::events::{EngineEvent, EventBus};
use crate::reliability::{
    CircuitBreaker, CircuitError, CircuitOpenError, CircuitSnapshot, CircuitState,
};
use crate::worker::{ExecOptions, PoolStats, ProcessPool, ShutdownReport, TaskHandle, TaskOutput};

/// Result of [`Engine::try_execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// The process ran to exit
    Completed(TaskOutput),
    /// The breaker refused the call; nothing was run
    CircuitOpen(CircuitOpenError),
}

impl Attempt {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    pub fn output(self) -> Option<TaskOutput> {
        match self {
            Self::Completed(output) => Some(output),
            Self::CircuitOpen(_) => None,
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    pool: ProcessPool,
    breaker: CircuitBreaker,
    events: EventBus,
}

/// Handle to the execution engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pool", &self.inner.pool)
            .field("circuit", &self.inner.breaker.state())
            .finish()
    }
}

impl Engine {
    /// Create an engine that audits to the `stagehand::audit` tracing target
    pub fn new(config: EngineConfig) -> Result<Self, ExecError> {
        Self::with_audit(config, Arc::new(TracingAuditSink))
    }

    /// Create an engine with a custom audit sink
    pub fn with_audit(config: EngineConfig, audit: Arc<dyn AuditSink>) -> Result<Self, ExecError> {
        let events = EventBus::default();
        let pool = ProcessPool::new(config.pool.clone(), audit, events.clone())?;
        let breaker =
            CircuitBreaker::new(config.circuit_breaker.clone()).with_events(events.clone());

        info!(
            max_workers = config.pool.max_workers,
            max_queue_size = config.pool.max_queue_size,
            failure_threshold = config.circuit_breaker.failure_threshold,
            "Execution engine started"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                pool,
                breaker,
                events,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Run a command and wait for it.
    ///
    /// Fails fast with [`ExecError::CircuitOpen`] while the breaker is open.
    /// Spawn failures, abnormal exits and timeouts count against the breaker.
    #[instrument(skip(self, args, options))]
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        options: ExecOptions,
    ) -> Result<TaskOutput, ExecError> {
        self.inner
            .breaker
            .execute_classified(
                || self.inner.pool.execute(command, args, options),
                ExecError::is_execution_failure,
            )
            .await
            .map_err(|e| match e {
                CircuitError::Open(open) => ExecError::CircuitOpen(open),
                CircuitError::Inner(e) => e,
            })
    }

    /// Like [`execute`](Self::execute), but an open circuit is a value
    /// rather than an error
    pub async fn try_execute(
        &self,
        command: &str,
        args: &[String],
        options: ExecOptions,
    ) -> Result<Attempt, ExecError> {
        match self.execute(command, args, options).await {
            Ok(output) => Ok(Attempt::Completed(output)),
            Err(ExecError::CircuitOpen(open)) => Ok(Attempt::CircuitOpen(open)),
            Err(e) => Err(e),
        }
    }

    /// Enqueue a command without waiting.
    ///
    /// The breaker is consulted now; the outcome is recorded against it
    /// when the task finishes, whether or not it is awaited.
    pub fn submit(
        &self,
        command: &str,
        args: &[String],
        options: ExecOptions,
    ) -> Result<SubmittedTask, ExecError> {
        self.inner.breaker.allow()?;
        let handle = self.inner.pool.submit(command, args, options)?;
        Ok(SubmittedTask {
            id: handle.id(),
            handle: Some(handle),
            engine: self.clone(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    pub fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.inner.breaker.snapshot()
    }

    /// Force the breaker closed
    pub fn reset_circuit(&self) {
        self.inner.breaker.reset();
    }

    /// Cancel a queued task. Running tasks are not affected.
    pub fn cancel_task(&self, task_id: Uuid) -> bool {
        self.inner.pool.cancel_task(task_id)
    }

    pub fn cancel_all_queued(&self) -> usize {
        self.inner.pool.cancel_all_queued()
    }

    /// Stop accepting work, wait up to `grace` for running tasks, then kill
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let report = self.inner.pool.shutdown(grace).await;
        info!(
            cancelled_queued = report.cancelled_queued,
            force_killed = report.force_killed,
            drained = report.drained,
            "Execution engine stopped"
        );
        report
    }

    pub fn force_kill_all(&self) -> usize {
        self.inner.pool.force_kill_all()
    }

    pub fn resize(&self, new_size: usize) -> Result<(), ExecError> {
        self.inner.pool.resize(new_size)
    }

    /// Receive task and circuit events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    fn record(&self, result: &Result<TaskOutput, ExecError>) {
        match result {
            Ok(_) => self.inner.breaker.record_success(),
            Err(e) if e.is_execution_failure() => self.inner.breaker.record_failure(),
            Err(_) => {}
        }
    }
}

/// A task submitted through [`Engine::submit`]
///
/// The outcome is recorded against the breaker exactly once: by
/// [`wait`](Self::wait), or, if the value is dropped unawaited, by a
/// background task that waits on its behalf. Dropping outside a Tokio
/// runtime leaves the outcome unrecorded.
#[derive(Debug)]
pub struct SubmittedTask {
    id: Uuid,
    handle: Option<TaskHandle>,
    engine: Engine,
}

impl SubmittedTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the outcome and record it against the breaker
    pub async fn wait(mut self) -> Result<TaskOutput, ExecError> {
        let Some(handle) = self.handle.take() else {
            return Err(ExecError::Cancelled);
        };
        let result = handle.wait().await;
        self.engine.record(&result);
        result
    }
}

impl Drop for SubmittedTask {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(task_id = %self.id, "Dropped outside a runtime, outcome not recorded");
            return;
        };
        let engine = self.engine.clone();
        runtime.spawn(async move {
            let result = handle.wait().await;
            engine.record(&result);
        });
    }
}
