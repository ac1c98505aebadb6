//! Circuit breaker guarding an external executable

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::duration_millis;
use crate::events::{EngineEventKind, EventBus};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if the executable recovered - calls allowed, one failure reopens
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘   (within window)   └─────────┘                 └──────────┘
///      ▲                               ▲          any failure       │
///      │                               └────────────────────────────┤
///      │              success threshold                             │
///      └────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use stagehand_exec::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_reset_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of failures within the window required to open the circuit
    pub failure_threshold: u32,

    /// Number of consecutive successes required to close the circuit (in half-open state)
    pub success_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,

    /// Sliding window size for failure counting
    #[serde(with = "duration_millis")]
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            window_size: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold to close the circuit
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the reset timeout (time before trying again after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the sliding window size for failure counting
    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }
}

/// The circuit is open; the call was not attempted
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("circuit breaker is open (retry in {}ms)", .retry_after.as_millis())]
pub struct CircuitOpenError {
    /// Time left until the breaker lets a probe call through
    pub retry_after: Duration,
}

/// Outcome of a call made through [`CircuitBreaker::execute`]
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// The wrapped error, if the call was attempted
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open(_) => None,
        }
    }
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures_in_window: u32,
    pub consecutive_successes: u32,
    /// Present only while open
    pub retry_after_ms: Option<u64>,
}

struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            consecutive_successes: 0,
            opened_at: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// In-process circuit breaker
///
/// One breaker guards one externally invoked subsystem. State changes only
/// through recorded outcomes, the open-to-half-open timer, and [`reset`].
///
/// # Example
///
/// ```ignore
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
/// match breaker.execute(|| run_editor()).await {
///     Ok(output) => { /* ... */ }
///     Err(CircuitError::Open(e)) => { /* fail fast, retry after e.retry_after */ }
///     Err(CircuitError::Inner(e)) => { /* the call ran and failed */ }
/// }
/// ```
///
/// [`reset`]: CircuitBreaker::reset
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::closed()),
            events: None,
        }
    }

    /// Publish state transitions on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state without side effects.
    ///
    /// An open breaker whose reset timeout has elapsed still reports `Open`
    /// until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.prune(now, self.config.window_size);
        CircuitSnapshot {
            state: state.state,
            failures_in_window: state.failures.len() as u32,
            consecutive_successes: state.consecutive_successes,
            retry_after_ms: match (state.state, state.opened_at) {
                (CircuitState::Open, Some(opened_at)) => Some(
                    self.config
                        .reset_timeout
                        .saturating_sub(now.duration_since(opened_at))
                        .as_millis() as u64,
                ),
                _ => None,
            },
        }
    }

    /// Check whether a call may proceed.
    ///
    /// The first call after the reset timeout moves an open breaker to half-open.
    pub fn allow(&self) -> Result<(), CircuitOpenError> {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.reset_timeout);
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        retry_after: self.config.reset_timeout - elapsed,
                    })
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.prune(Instant::now(), self.config.window_size);
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut state, CircuitState::Closed);
                }
            }
            // A call admitted before the breaker opened finished late
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => {
                state.prune(now, self.config.window_size);
                state.failures.push_back(now);
                if state.failures.len() as u32 >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut state, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed and clear all counters
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.state != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        } else {
            *state = BreakerState::closed();
        }
    }

    /// Run `f` through the breaker, counting every error as a failure
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_classified(f, |_| true).await
    }

    /// Run `f` through the breaker. Errors for which `is_failure` returns
    /// false are passed through without touching the failure accounting.
    pub async fn execute_classified<F, Fut, T, E, P>(
        &self,
        f: F,
        is_failure: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        self.allow()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    self.record_failure();
                }
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        match to {
            CircuitState::Open => {
                warn!(
                    failures = state.failures.len(),
                    reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                    "Circuit breaker opened"
                );
                state.opened_at = Some(Instant::now());
                state.failures.clear();
                state.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {
                info!("Circuit breaker half-open, probing");
                state.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                info!(%from, "Circuit breaker closed");
                *state = BreakerState::closed();
            }
        }
        state.state = to;

        if let Some(events) = &self.events {
            events.emit(EngineEventKind::CircuitTransition { from, to });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn create_test_breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_success_threshold(2)
                .with_reset_timeout(Duration::from_millis(100))
                .with_window_size(Duration::from_secs(10)),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.execute(|| async { Ok::<(), &str>(()) }).await
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.window_size, Duration::from_secs(60));
    }

    #[test]
    fn test_config_builder() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(10)
            .with_success_threshold(3)
            .with_reset_timeout(Duration::from_secs(60));

        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_config_serialization() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["reset_timeout"], 30_000);
        let parsed: CircuitBreakerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, parsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_closed() {
        let breaker = create_test_breaker();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_failure_threshold() {
        let breaker = create_test_breaker();

        for _ in 0..2 {
            assert!(matches!(fail(&breaker).await, Err(CircuitError::Inner("boom"))));
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking() {
        let breaker = create_test_breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        let calls = AtomicU32::new(0);
        let result = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &str>(())
            })
            .await;

        match result {
            Err(CircuitError::Open(e)) => assert!(e.retry_after <= Duration::from_millis(100)),
            other => panic!("expected open circuit, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_to_half_open_after_timeout() {
        let breaker = create_test_breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        tokio::time::advance(Duration::from_millis(150)).await;
        // Still reported open until a call arrives
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.allow().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_after_success_threshold_in_half_open() {
        let breaker = create_test_breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failures_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopens_on_failure_in_half_open() {
        let breaker = create_test_breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(succeed(&breaker).await.is_ok());
        assert!(matches!(fail(&breaker).await, Err(CircuitError::Inner(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(CircuitError::Open(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_expire() {
        let breaker = create_test_breaker();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;

        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&breaker).await;

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failures_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_errors_do_not_count() {
        let breaker = create_test_breaker();
        for _ in 0..5 {
            let result = breaker
                .execute_classified(|| async { Err::<(), _>("rejected") }, |_| false)
                .await;
            assert!(matches!(result, Err(CircuitError::Inner("rejected"))));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failures_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let breaker = create_test_breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_retry_after() {
        let breaker = create_test_breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_millis(40)).await;

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.retry_after_ms, Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_are_published() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let breaker = create_test_breaker().with_events(events);

        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_millis(150)).await;
        let _ = succeed(&breaker).await;
        let _ = succeed(&breaker).await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let EngineEventKind::CircuitTransition { from, to } = event.kind {
                seen.push((from, to));
            }
        }
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }
}
