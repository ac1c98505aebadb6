//! # Stagehand Execution Engine
//!
//! Runs external editor executables on behalf of automation tool handlers,
//! safely and with bounded resource usage.
//!
//! ## Features
//!
//! - **Shell-free spawning**: arguments reach the OS as discrete tokens, after an injection check
//! - **Bounded pool**: a fixed number of concurrent processes and a FIFO backlog with backpressure
//! - **Timeouts**: processes that overrun are killed with a non-ignorable signal
//! - **Circuit breaker**: fails fast while the executable keeps failing, then probes for recovery
//! - **Graceful shutdown**: drain with a deadline, then force-kill
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │  (cloneable handle used by tool handlers)                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CircuitBreaker                          │
//! │  (closed / open / half-open, sliding failure window)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ProcessPool                            │
//! │  (validate, queue or dispatch, timeout, cancel, shutdown)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use stagehand_exec::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::from_env()?)?;
//!
//! let output = engine
//!     .execute(
//!         "godot",
//!         &["--headless".into(), "--import".into()],
//!         ExecOptions::new().with_timeout_ms(60_000),
//!     )
//!     .await?;
//! println!("exit code {}", output.exit_code);
//!
//! engine.shutdown(Duration::from_secs(5)).await;
//! ```

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod reliability;
pub mod validator;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::audit::{AuditEvent, AuditSink, TracingAuditSink};
    pub use crate::config::{ConfigError, EngineConfig};
    pub use crate::engine::{Attempt, Engine, SubmittedTask};
    pub use crate::error::ExecError;
    pub use crate::events::{EngineEvent, EngineEventKind};
    pub use crate::reliability::{CircuitBreakerConfig, CircuitOpenError, CircuitState};
    pub use crate::worker::{ExecOptions, PoolConfig, PoolStats, ShutdownReport, TaskOutput};
}

// Re-export key types at crate root
pub use audit::{AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Attempt, Engine, SubmittedTask};
pub use error::ExecError;
pub use events::{EngineEvent, EngineEventKind, EventBus};
pub use reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitOpenError, CircuitSnapshot,
    CircuitState,
};
pub use validator::{validate, TokenLocation, ValidationError};
pub use worker::{
    ExecOptions, PoolConfig, PoolStats, ProcessPool, ShutdownReport, TaskHandle, TaskOutput,
};
