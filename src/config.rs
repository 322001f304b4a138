//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

use crate::outbox::DEFAULT_MAX_RETRIES;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Environment (development, production)
    pub environment: String,

    /// Unit-of-work retry behaviour
    pub retry: RetryPolicy,

    /// Outbox delivery behaviour
    pub outbox: OutboxPolicy,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = parse_env("DATABASE_MAX_CONNECTIONS", "10")?;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let retry = RetryPolicy {
            max_retries: parse_env("UOW_MAX_RETRIES", "3")?,
            backoff_base: Duration::from_millis(parse_env("UOW_BACKOFF_BASE_MS", "1000")?),
        };

        let outbox = OutboxPolicy {
            max_retries: parse_env("OUTBOX_MAX_RETRIES", "3")?,
            batch_size: parse_env("OUTBOX_BATCH_SIZE", "100")?,
            drain_interval: Duration::from_secs(parse_env("OUTBOX_DRAIN_INTERVAL_SECS", "5")?),
            delivery_timeout: Duration::from_secs(parse_env("OUTBOX_DELIVERY_TIMEOUT_SECS", "30")?),
        };

        if outbox.batch_size == 0 {
            return Err(ConfigError::InvalidValue("OUTBOX_BATCH_SIZE"));
        }

        Ok(Self {
            database_url,
            database_max_connections,
            environment,
            retry,
            outbox,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::InvalidValue(name))
}

/// Retry behaviour for transient unit-of-work failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_retries: u32,
    /// Delay unit; attempt `n` waits `2^n` units before the next one
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

/// Outbox delivery settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxPolicy {
    /// Failed attempts before an event is quarantined
    pub max_retries: u32,
    /// Events fetched per drain pass
    pub batch_size: usize,
    /// Pause between drain passes
    pub drain_interval: Duration,
    /// Longest a single publish may take
    pub delivery_timeout: Duration,
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            batch_size: 100,
            drain_interval: Duration::from_secs(5),
            delivery_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
