//! Process workers
//!
//! This module provides the execution side of the engine:
//! - Task types and submission handles
//! - Shell-free process spawning with output capture and timeouts
//! - A bounded, resizable pool with a FIFO backlog and graceful shutdown

mod pool;
mod process;
mod task;

pub use pool::{PoolConfig, PoolStats, ProcessPool, ShutdownReport};
pub use task::{ExecOptions, TaskHandle, TaskOutput};
