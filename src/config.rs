//! Configuration for the queue engine.
//!
//! Configuration is sourced from the environment once at startup. `REDIS_HOST`
//! and `API_TOKEN` are required; everything else has a default. Values that
//! fail to parse fall back to their defaults rather than aborting startup.

use crate::{ConveyorError, Result};
use std::time::Duration;

/// Connection settings for the backing Redis server.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
}

impl RedisConfig {
    /// Assemble a `redis://` connection URL from the individual settings.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Engine configuration, read once at process start.
///
/// # Examples
///
/// ```rust,no_run
/// use conveyor::Config;
///
/// let config = Config::from_env().expect("REDIS_HOST and API_TOKEN must be set");
/// println!("connecting to {}", config.redis.url());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Backing store connection settings.
    pub redis: RedisConfig,
    /// Bearer token the REST collaborator authenticates with.
    pub api_token: String,
    /// Consumer count used when neither the caller nor the queue specifies one.
    pub default_concurrency: usize,
    /// Default `max_attempts` applied to jobs enqueued without options.
    pub default_retry_attempts: u32,
    /// Base delay for the queue's retry backoff.
    pub default_retry_delay: Duration,
    /// Default timeout for webhook deliveries.
    pub webhook_timeout: Duration,
    /// Default attempt count for webhook deliveries.
    pub webhook_retry_attempts: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Fails with [`ConveyorError::Config`] when `REDIS_HOST` or `API_TOKEN`
    /// is absent; those two have no sensible default.
    pub fn from_env() -> Result<Self> {
        let host = require_env("REDIS_HOST")?;
        let api_token = require_env("API_TOKEN")?;

        Ok(Self {
            redis: RedisConfig {
                host,
                port: env_parsed("REDIS_PORT", 6379),
                password: std::env::var("REDIS_PASSWORD")
                    .ok()
                    .filter(|p| !p.is_empty()),
                db: env_parsed("REDIS_DB", 0),
            },
            api_token,
            default_concurrency: env_parsed("DEFAULT_CONCURRENCY", 5),
            default_retry_attempts: env_parsed("DEFAULT_RETRY_ATTEMPTS", 3),
            default_retry_delay: Duration::from_millis(env_parsed("DEFAULT_RETRY_DELAY_MS", 1000)),
            webhook_timeout: Duration::from_millis(env_parsed("WEBHOOK_TIMEOUT_MS", 30_000)),
            webhook_retry_attempts: env_parsed("WEBHOOK_RETRY_ATTEMPTS", 3),
        })
    }

    /// The assembled Redis connection URL.
    pub fn redis_url(&self) -> String {
        self.redis.url()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis: RedisConfig {
                host: "127.0.0.1".to_string(),
                port: 6379,
                password: None,
                db: 0,
            },
            api_token: String::new(),
            default_concurrency: 5,
            default_retry_attempts: 3,
            default_retry_delay: Duration::from_millis(1000),
            webhook_timeout: Duration::from_millis(30_000),
            webhook_retry_attempts: 3,
        }
    }
}

fn require_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConveyorError::Config {
            message: format!("required environment variable {} is not set", name),
        }),
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
