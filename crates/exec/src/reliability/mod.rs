//! Reliability patterns for process execution
//!
//! This module provides:
//! - [`CircuitBreaker`] - Fail-fast protection for an unhealthy executable
//! - [`CircuitBreakerConfig`] - Circuit breaker configuration

mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitOpenError, CircuitSnapshot,
    CircuitState,
};
