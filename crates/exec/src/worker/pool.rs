//! Bounded process pool
//!
//! A fixed (resizable) set of workers runs at most one process each. Tasks
//! that find no idle worker wait in a FIFO queue of bounded length; the next
//! queued task always goes to the first worker that frees up.
//!
//! All pool state sits behind one mutex. It is only held for bookkeeping,
//! never across an await.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::process::{run_process, validate_invocation};
use super::task::{Completion, ExecOptions, QueuedTask, TaskHandle, TaskOutput, TaskSpec};
use crate::audit::{AuditEvent, AuditSink};
use crate::config::duration_millis;
use crate::error::ExecError;
use crate::events::{EngineEventKind, EventBus};

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of processes running at once
    pub max_workers: usize,

    /// Maximum number of tasks waiting for a worker
    pub max_queue_size: usize,

    /// Timeout applied when a task does not set one. Zero disables it.
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,

    /// How often shutdown checks whether running tasks have finished
    #[serde(with = "duration_millis")]
    pub shutdown_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue_size: 100,
            default_timeout: Duration::from_secs(30),
            shutdown_poll_interval: Duration::from_millis(100),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers
    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    /// Set the queue limit
    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    /// Set the default task timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the shutdown poll interval
    pub fn with_shutdown_poll_interval(mut self, interval: Duration) -> Self {
        self.shutdown_poll_interval = interval;
        self
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub queued_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Mean run time of completed tasks
    pub average_duration_ms: f64,
}

/// What [`ProcessPool::shutdown`] had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Tasks removed from the queue without running
    pub cancelled_queued: usize,
    /// Running processes killed at the deadline
    pub force_killed: usize,
    /// Whether every running task finished before the deadline
    pub drained: bool,
}

/// The process a worker is currently responsible for
struct Assignment {
    task_id: Uuid,
    command: String,
    pid: Option<u32>,
    started_at: Instant,
    kill: CancellationToken,
}

struct Worker {
    id: u64,
    current: Option<Assignment>,
}

impl Worker {
    fn is_busy(&self) -> bool {
        self.current.is_some()
    }
}

/// A task handed to a worker, ready to be driven
struct Dispatch {
    worker_id: u64,
    task: QueuedTask,
    kill: CancellationToken,
}

struct PoolState {
    workers: Vec<Worker>,
    /// Size requested by the last resize; busy workers above it retire when done
    target_size: usize,
    queue: VecDeque<QueuedTask>,
    shutting_down: bool,
    next_worker_id: u64,
    completed: u64,
    failed: u64,
    completed_duration: Duration,
}

impl PoolState {
    fn new(size: usize) -> Self {
        let mut state = Self {
            workers: Vec::with_capacity(size),
            target_size: size,
            queue: VecDeque::new(),
            shutting_down: false,
            next_worker_id: 0,
            completed: 0,
            failed: 0,
            completed_duration: Duration::ZERO,
        };
        state.grow_to(size);
        state
    }

    fn grow_to(&mut self, size: usize) {
        while self.workers.len() < size {
            let id = self.next_worker_id;
            self.next_worker_id += 1;
            self.workers.push(Worker { id, current: None });
        }
    }

    fn busy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy()).count()
    }

    fn worker_mut(&mut self, worker_id: u64) -> Option<&mut Worker> {
        self.workers.iter_mut().find(|w| w.id == worker_id)
    }

    fn assign(&mut self, index: usize, task: QueuedTask) -> Dispatch {
        let kill = CancellationToken::new();
        let worker = &mut self.workers[index];
        worker.current = Some(Assignment {
            task_id: task.id(),
            command: task.spec.command.clone(),
            pid: None,
            started_at: Instant::now(),
            kill: kill.clone(),
        });
        Dispatch {
            worker_id: worker.id,
            task,
            kill,
        }
    }

    /// Hand queued tasks to idle workers in FIFO order
    fn drain_queue(&mut self) -> Vec<Dispatch> {
        let mut dispatched = Vec::new();
        while !self.queue.is_empty() {
            let Some(index) = self.workers.iter().position(|w| !w.is_busy()) else {
                break;
            };
            if let Some(task) = self.queue.pop_front() {
                dispatched.push(self.assign(index, task));
            }
        }
        dispatched
    }
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    audit: Arc<dyn AuditSink>,
    events: EventBus,
}

/// Bounded pool of external-process workers.
///
/// Cloning is cheap; clones share the same workers and queue. Methods that
/// start processes must be called from within a Tokio runtime.
///
/// # Example
///
/// ```ignore
/// use stagehand_exec::worker::{ExecOptions, PoolConfig, ProcessPool};
///
/// let pool = ProcessPool::new(
///     PoolConfig::new().with_max_workers(2),
///     Arc::new(TracingAuditSink),
///     EventBus::default(),
/// )?;
///
/// let output = pool
///     .execute("godot", &["--headless".into(), "--version".into()], ExecOptions::new())
///     .await?;
///
/// pool.shutdown(Duration::from_secs(5)).await;
/// ```
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ProcessPool {
    /// Create a pool with `config.max_workers` idle workers
    pub fn new(
        config: PoolConfig,
        audit: Arc<dyn AuditSink>,
        events: EventBus,
    ) -> Result<Self, ExecError> {
        if config.max_workers < 1 {
            return Err(ExecError::InvalidPoolSize(config.max_workers));
        }

        let state = PoolState::new(config.max_workers);
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
                audit,
                events,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Enqueue a task and return immediately.
    ///
    /// The task starts at once if a worker is idle, otherwise it joins the
    /// back of the queue.
    #[instrument(skip(self, args, options))]
    pub fn submit(
        &self,
        command: &str,
        args: &[String],
        options: ExecOptions,
    ) -> Result<TaskHandle, ExecError> {
        validate_invocation(command, args, self.inner.audit.as_ref())?;

        let spec = TaskSpec {
            id: Uuid::now_v7(),
            command: command.to_string(),
            args: args.to_vec(),
            working_directory: options.working_directory,
            timeout: options.timeout.unwrap_or(self.inner.config.default_timeout),
        };

        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return Err(ExecError::PoolShuttingDown);
        }

        let idle = state.workers.iter().position(|w| !w.is_busy());
        if let Some(index) = idle {
            let (task, handle) = QueuedTask::new(spec);
            let dispatch = state.assign(index, task);
            drop(state);
            self.inner.start(dispatch);
            return Ok(handle);
        }

        if state.queue.len() >= self.inner.config.max_queue_size {
            debug!(
                queued = state.queue.len(),
                max_queue_size = self.inner.config.max_queue_size,
                "Queue full, rejecting task"
            );
            return Err(ExecError::QueueFull {
                max_queue_size: self.inner.config.max_queue_size,
            });
        }

        let (task, handle) = QueuedTask::new(spec);
        let task_id = task.id();
        state.queue.push_back(task);
        let queue_len = state.queue.len();
        drop(state);

        debug!(%task_id, queue_len, "Task queued");
        self.inner
            .events
            .emit(EngineEventKind::TaskQueued { task_id, queue_len });
        Ok(handle)
    }

    /// Run a task and wait for its outcome
    pub async fn execute(
        &self,
        command: &str,
        args: &[String],
        options: ExecOptions,
    ) -> Result<TaskOutput, ExecError> {
        self.submit(command, args, options)?.wait().await
    }

    /// Change the number of workers.
    ///
    /// Growing adds idle workers that immediately take queued tasks.
    /// Shrinking removes idle workers; busy workers above the new size finish
    /// their task and then retire.
    #[instrument(skip(self))]
    pub fn resize(&self, new_size: usize) -> Result<(), ExecError> {
        if new_size < 1 {
            return Err(ExecError::InvalidPoolSize(new_size));
        }

        let mut state = self.inner.state.lock();
        let previous = state.workers.len();
        state.target_size = new_size;

        if new_size > previous {
            state.grow_to(new_size);
        } else {
            let mut surplus = previous - new_size;
            state.workers.retain(|w| {
                if surplus > 0 && !w.is_busy() {
                    surplus -= 1;
                    false
                } else {
                    true
                }
            });
        }

        let dispatched = state.drain_queue();
        let current = state.workers.len();
        drop(state);

        info!(previous, requested = new_size, current, "Resized pool");
        for dispatch in dispatched {
            self.inner.start(dispatch);
        }
        Ok(())
    }

    /// Remove a queued task and resolve it as cancelled.
    ///
    /// Returns `false` for running or unknown tasks; those are unaffected.
    pub fn cancel_task(&self, task_id: Uuid) -> bool {
        let task = {
            let mut state = self.inner.state.lock();
            let Some(position) = state.queue.iter().position(|t| t.id() == task_id) else {
                return false;
            };
            state.queue.remove(position)
        };

        match task {
            Some(task) => {
                self.inner.cancel_queued(task);
                true
            }
            None => false,
        }
    }

    /// Cancel every queued task. Returns how many were cancelled.
    pub fn cancel_all_queued(&self) -> usize {
        let tasks: Vec<_> = self.inner.state.lock().queue.drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            self.inner.cancel_queued(task);
        }
        if count > 0 {
            info!(count, "Cancelled queued tasks");
        }
        count
    }

    /// Stop accepting work and wait for running tasks.
    ///
    /// Queued tasks are cancelled right away. Running tasks get until
    /// `grace` elapses, after which they are killed. Always returns.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let deadline = Instant::now() + grace;
        let queued: Vec<_> = {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.queue.drain(..).collect()
        };
        info!("Shutting down process pool");

        let cancelled_queued = queued.len();
        for task in queued {
            self.inner.cancel_queued(task);
        }

        loop {
            let busy = self.inner.state.lock().busy_count();
            if busy == 0 {
                debug!("All running tasks finished");
                return ShutdownReport {
                    cancelled_queued,
                    force_killed: 0,
                    drained: true,
                };
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(remaining_tasks = busy, "Shutdown deadline reached, killing");
                let force_killed = self.inner.kill_running("shutdown deadline exceeded");
                return ShutdownReport {
                    cancelled_queued,
                    force_killed,
                    drained: false,
                };
            }

            let poll = self.inner.config.shutdown_poll_interval;
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Kill every running process and cancel the queue.
    ///
    /// Returns the number of processes killed. The pool keeps accepting work.
    #[instrument(skip(self))]
    pub fn force_kill_all(&self) -> usize {
        self.cancel_all_queued();
        let killed = self.inner.kill_running("force kill requested");
        if killed > 0 {
            warn!(killed, "Force killed running processes");
        }
        killed
    }

    /// Snapshot of workers, queue and counters
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let total_workers = state.workers.len();
        let busy_workers = state.busy_count();
        let average_duration_ms = if state.completed == 0 {
            0.0
        } else {
            state.completed_duration.as_secs_f64() * 1000.0 / state.completed as f64
        };

        PoolStats {
            total_workers,
            busy_workers,
            idle_workers: total_workers - busy_workers,
            queued_tasks: state.queue.len(),
            completed_tasks: state.completed,
            failed_tasks: state.failed,
            average_duration_ms,
        }
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

impl PoolInner {
    fn start(self: &Arc<Self>, dispatch: Dispatch) {
        self.announce(&dispatch);
        tokio::spawn(Arc::clone(self).drive(dispatch));
    }

    fn announce(&self, dispatch: &Dispatch) {
        debug!(
            task_id = %dispatch.task.id(),
            worker_id = dispatch.worker_id,
            waited_ms = dispatch.task.enqueued_at.elapsed().as_millis() as u64,
            "Task dispatched"
        );
        self.events.emit(EngineEventKind::TaskStarted {
            task_id: dispatch.task.id(),
            worker_id: dispatch.worker_id,
            command: dispatch.task.spec.command.clone(),
        });
    }

    /// Run tasks on one worker until it goes idle or retires
    async fn drive(self: Arc<Self>, mut dispatch: Dispatch) {
        loop {
            let Dispatch {
                worker_id,
                task,
                kill,
            } = dispatch;
            let (spec, completion) = task.into_parts();

            let result = run_process(&spec, kill, self.audit.as_ref(), |pid| {
                self.record_pid(worker_id, spec.id, pid)
            })
            .await;

            match self.finish(worker_id, &spec, result, completion) {
                Some(next) => {
                    self.announce(&next);
                    dispatch = next;
                }
                None => break,
            }
        }
    }

    fn record_pid(&self, worker_id: u64, task_id: Uuid, pid: Option<u32>) {
        let mut state = self.state.lock();
        if let Some(assignment) = state
            .worker_mut(worker_id)
            .and_then(|w| w.current.as_mut())
            .filter(|a| a.task_id == task_id)
        {
            assignment.pid = pid;
        }
    }

    /// Record the outcome, free the worker and pick its next task
    fn finish(
        &self,
        worker_id: u64,
        spec: &TaskSpec,
        result: Result<TaskOutput, ExecError>,
        completion: Completion,
    ) -> Option<Dispatch> {
        let mut state = self.state.lock();

        let assignment = state.worker_mut(worker_id).and_then(|w| w.current.take());
        let elapsed = assignment
            .map(|a| a.started_at.elapsed())
            .unwrap_or_default();

        match &result {
            Ok(output) => {
                state.completed += 1;
                state.completed_duration += output.duration;
            }
            Err(_) => state.failed += 1,
        }

        let next = if state.workers.len() > state.target_size {
            state.workers.retain(|w| w.id != worker_id);
            debug!(worker_id, "Retired surplus worker");
            None
        } else if state.shutting_down {
            None
        } else {
            let index = state.workers.iter().position(|w| w.id == worker_id);
            match (index, state.queue.pop_front()) {
                (Some(index), Some(task)) => Some(state.assign(index, task)),
                (None, Some(task)) => {
                    state.queue.push_front(task);
                    None
                }
                _ => None,
            }
        };
        drop(state);

        let event = match &result {
            Ok(output) => {
                debug!(
                    task_id = %spec.id,
                    exit_code = output.exit_code,
                    duration_ms = output.duration.as_millis() as u64,
                    "Task completed"
                );
                EngineEventKind::TaskCompleted {
                    task_id: spec.id,
                    exit_code: output.exit_code,
                    duration_ms: output.duration.as_millis() as u64,
                }
            }
            Err(e) => {
                debug!(task_id = %spec.id, error = %e, "Task failed");
                EngineEventKind::TaskFailed {
                    task_id: spec.id,
                    error: e.to_string(),
                    duration_ms: elapsed.as_millis() as u64,
                }
            }
        };

        self.events.emit(event);
        let _ = completion.send(result);
        next
    }

    fn cancel_queued(&self, task: QueuedTask) {
        let task_id = task.id();
        debug!(%task_id, "Cancelled queued task");
        self.events.emit(EngineEventKind::TaskCancelled { task_id });
        task.complete(Err(ExecError::Cancelled));
    }

    /// Signal every running process to die. Returns how many were signalled.
    fn kill_running(&self, reason: &str) -> usize {
        let targets: Vec<_> = {
            let state = self.state.lock();
            state
                .workers
                .iter()
                .filter_map(|w| w.current.as_ref())
                .filter(|a| !a.kill.is_cancelled())
                .map(|a| (a.command.clone(), a.pid, a.kill.clone()))
                .collect()
        };

        for (command, pid, kill) in &targets {
            debug!(%command, ?pid, %reason, "Killing process");
            self.audit.record(AuditEvent::ProcessKill {
                command: command.clone(),
                reason: reason.to_string(),
            });
            kill.cancel();
        }
        targets.len()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn pool(workers: usize, queue: usize) -> (ProcessPool, MemoryAuditSink) {
        let audit = MemoryAuditSink::new();
        let pool = ProcessPool::new(
            PoolConfig::new()
                .with_max_workers(workers)
                .with_max_queue_size(queue)
                .with_shutdown_poll_interval(Duration::from_millis(10)),
            Arc::new(audit.clone()),
            EventBus::default(),
        )
        .unwrap();
        (pool, audit)
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = ProcessPool::new(
            PoolConfig::new().with_max_workers(0),
            Arc::new(MemoryAuditSink::new()),
            EventBus::default(),
        )
        .unwrap_err();
        assert_eq!(err, ExecError::InvalidPoolSize(0));
    }

    #[tokio::test]
    async fn test_execute_runs_process() {
        let (pool, _) = pool(2, 10);
        let output = pool
            .execute("echo", &args(&["ready"]), ExecOptions::new())
            .await
            .unwrap();

        assert_eq!(output.stdout.trim(), "ready");
        let stats = pool.stats();
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.busy_workers, 0);
        assert_eq!(stats.idle_workers, 2);
    }

    #[tokio::test]
    async fn test_injection_rejected_and_audited() {
        let (pool, audit) = pool(1, 10);
        let err = pool
            .submit("echo", &args(&["a", "b;rm"]), ExecOptions::new())
            .unwrap_err();

        assert!(matches!(err, ExecError::InjectionRejected(_)));
        assert!(matches!(
            audit.events()[0],
            AuditEvent::InjectionAttempt { .. }
        ));
        assert_eq!(pool.stats().queued_tasks, 0);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let (pool, _) = pool(1, 1);
        let running = pool
            .submit("sleep", &args(&["5"]), ExecOptions::new())
            .unwrap();
        let queued = pool
            .submit("sleep", &args(&["5"]), ExecOptions::new())
            .unwrap();

        let err = pool
            .submit("sleep", &args(&["5"]), ExecOptions::new())
            .unwrap_err();
        assert_eq!(err, ExecError::QueueFull { max_queue_size: 1 });
        assert_eq!(pool.stats().queued_tasks, 1);

        pool.force_kill_all();
        assert_eq!(queued.wait().await.unwrap_err(), ExecError::Cancelled);
        assert_eq!(running.wait().await.unwrap_err(), ExecError::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let (pool, _) = pool(1, 5);
        let running = pool
            .submit("sleep", &args(&["5"]), ExecOptions::new())
            .unwrap();
        let queued = pool
            .submit("sleep", &args(&["5"]), ExecOptions::new())
            .unwrap();

        assert!(!pool.cancel_task(running.id()));
        assert!(pool.cancel_task(queued.id()));
        assert!(!pool.cancel_task(queued.id()));
        assert!(!pool.cancel_task(Uuid::now_v7()));
        assert_eq!(queued.wait().await.unwrap_err(), ExecError::Cancelled);
        assert_eq!(pool.stats().busy_workers, 1);

        pool.force_kill_all();
        let _ = running.wait().await;
    }

    #[tokio::test]
    async fn test_queued_tasks_run_in_order() {
        let (pool, _) = pool(1, 10);
        let mut rx = pool.inner.events.subscribe();

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let n = i.to_string();
                pool.submit("echo", &args(&[n.as_str()]), ExecOptions::new())
                    .unwrap()
            })
            .collect();
        let ids: Vec<_> = handles.iter().map(|h| h.id()).collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        let mut started = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEventKind::TaskStarted { task_id, .. } = event.kind {
                started.push(task_id);
            }
        }
        assert_eq!(started, ids);
    }

    #[tokio::test]
    async fn test_resize_rejects_zero() {
        let (pool, _) = pool(2, 10);
        assert_eq!(pool.resize(0).unwrap_err(), ExecError::InvalidPoolSize(0));
        assert_eq!(pool.stats().total_workers, 2);
    }

    #[tokio::test]
    async fn test_resize_grow_drains_queue() {
        let (pool, _) = pool(1, 10);
        let first = pool
            .submit("sleep", &args(&["5"]), ExecOptions::new())
            .unwrap();
        let second = pool
            .submit("echo", &args(&["next"]), ExecOptions::new())
            .unwrap();
        assert_eq!(pool.stats().queued_tasks, 1);

        pool.resize(2).unwrap();
        let output = second.wait().await.unwrap();
        assert_eq!(output.stdout.trim(), "next");

        pool.force_kill_all();
        let _ = first.wait().await;
    }

    #[tokio::test]
    async fn test_shrink_retires_busy_worker_after_task() {
        let (pool, _) = pool(2, 10);
        let a = pool
            .submit("sleep", &args(&["0.2"]), ExecOptions::new())
            .unwrap();
        let b = pool
            .submit("sleep", &args(&["0.2"]), ExecOptions::new())
            .unwrap();

        pool.resize(1).unwrap();
        assert_eq!(pool.stats().total_workers, 2);
        assert_eq!(pool.stats().busy_workers, 2);

        a.wait().await.unwrap();
        b.wait().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total_workers, 1);
        assert_eq!(stats.completed_tasks, 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let (pool, _) = pool(1, 10);
        let report = pool.shutdown(Duration::from_secs(1)).await;
        assert!(report.drained);
        assert!(pool.is_shutting_down());

        let err = pool
            .submit("echo", &args(&["late"]), ExecOptions::new())
            .unwrap_err();
        assert_eq!(err, ExecError::PoolShuttingDown);
    }

    #[tokio::test]
    async fn test_shutdown_kills_at_deadline() {
        let (pool, audit) = pool(1, 10);
        let running = pool
            .submit("sleep", &args(&["30"]), ExecOptions::new())
            .unwrap();
        let queued = pool
            .submit("sleep", &args(&["30"]), ExecOptions::new())
            .unwrap();

        let started = std::time::Instant::now();
        let report = pool.shutdown(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(2));

        assert_eq!(
            report,
            ShutdownReport {
                cancelled_queued: 1,
                force_killed: 1,
                drained: false,
            }
        );
        assert_eq!(queued.wait().await.unwrap_err(), ExecError::Cancelled);
        assert_eq!(running.wait().await.unwrap_err(), ExecError::Cancelled);
        assert!(audit
            .events()
            .iter()
            .any(|e| matches!(e, AuditEvent::ProcessKill { .. })));
    }

    #[tokio::test]
    async fn test_finishing_worker_takes_no_work_once_shutting_down() {
        let (pool, _) = pool(1, 10);
        let running = pool
            .submit("sleep", &args(&["0.2"]), ExecOptions::new())
            .unwrap();
        let queued = pool
            .submit("echo", &args(&["too late"]), ExecOptions::new())
            .unwrap();

        // Flag set but queue not yet drained
        pool.inner.state.lock().shutting_down = true;
        running.wait().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.busy_workers, 0);
        assert_eq!(stats.queued_tasks, 1);

        assert_eq!(pool.cancel_all_queued(), 1);
        assert_eq!(queued.wait().await.unwrap_err(), ExecError::Cancelled);
    }

    #[tokio::test]
    async fn test_failures_are_counted() {
        let (pool, _) = pool(1, 10);
        let err = pool
            .execute("stagehand-missing-binary", &[], ExecOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SpawnFailed { .. }));

        let stats = pool.stats();
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.completed_tasks, 0);
        assert_eq!(stats.average_duration_ms, 0.0);
    }
}
