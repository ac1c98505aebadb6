//! Engine configuration
//!
//! Defaults are usable as-is. Hosts typically start from
//! [`EngineConfig::from_env`] and override individual fields.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reliability::CircuitBreakerConfig;
use crate::worker::PoolConfig;

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is set but cannot be parsed
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    /// The configuration is internally inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Full engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables (all optional):
    /// - `STAGEHAND_MAX_WORKERS`: Concurrent processes (default: 4)
    /// - `STAGEHAND_MAX_QUEUE_SIZE`: Backlog limit (default: 100)
    /// - `STAGEHAND_DEFAULT_TIMEOUT_MS`: Per-task timeout, 0 disables (default: 30000)
    /// - `STAGEHAND_SHUTDOWN_POLL_MS`: Shutdown drain poll interval (default: 100)
    /// - `STAGEHAND_CB_FAILURE_THRESHOLD`: Failures that open the circuit (default: 5)
    /// - `STAGEHAND_CB_SUCCESS_THRESHOLD`: Probe successes that close it (default: 2)
    /// - `STAGEHAND_CB_RESET_TIMEOUT_MS`: Open-to-half-open delay (default: 30000)
    /// - `STAGEHAND_CB_WINDOW_MS`: Failure counting window (default: 60000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading values through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse(&lookup, "STAGEHAND_MAX_WORKERS")? {
            config.pool.max_workers = n;
        }
        if let Some(n) = parse(&lookup, "STAGEHAND_MAX_QUEUE_SIZE")? {
            config.pool.max_queue_size = n;
        }
        if let Some(ms) = parse(&lookup, "STAGEHAND_DEFAULT_TIMEOUT_MS")? {
            config.pool.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "STAGEHAND_SHUTDOWN_POLL_MS")? {
            config.pool.shutdown_poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "STAGEHAND_CB_FAILURE_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = n;
        }
        if let Some(n) = parse(&lookup, "STAGEHAND_CB_SUCCESS_THRESHOLD")? {
            config.circuit_breaker.success_threshold = n;
        }
        if let Some(ms) = parse(&lookup, "STAGEHAND_CB_RESET_TIMEOUT_MS")? {
            config.circuit_breaker.reset_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "STAGEHAND_CB_WINDOW_MS")? {
            config.circuit_breaker.window_size = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the pool configuration
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the circuit breaker configuration
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_workers < 1 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.pool.shutdown_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "shutdown_poll_interval must be greater than zero".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit breaker failure_threshold must be at least 1".into(),
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit breaker success_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
