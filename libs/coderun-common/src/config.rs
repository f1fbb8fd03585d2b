// Shared configuration read from the environment
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::queue::EnqueueOptions;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Read `key` from the environment, falling back to `default` when unset.
pub fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            value,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Broker settings used by both the API (enqueue side) and the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub redis_url: String,
    pub task_timeout: Duration,
    pub max_retry: u32,
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            redis_url: env_or("REDIS_URL", DEFAULT_REDIS_URL.to_string())?,
            task_timeout: Duration::from_secs(env_or("EXECUTION_TIMEOUT_SECS", 30u64)?),
            max_retry: env_or("EXECUTION_MAX_RETRY", 3u32)?,
        };

        if config.task_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "EXECUTION_TIMEOUT_SECS".to_string(),
                value: "0".to_string(),
                reason: "timeout must be positive".to_string(),
            });
        }

        Ok(config)
    }

    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            timeout: self.task_timeout,
            max_retry: self.max_retry,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            task_timeout: Duration::from_secs(30),
            max_retry: 3,
        }
    }
}
