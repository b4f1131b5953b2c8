//! Configuration
//!
//! All settings come from the process environment. `main` loads `.env`
//! first, so a local file can stand in for real variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::consumer::DEFAULT_PERSIST_TIMEOUT_MS;
use crate::normalizer::PrecisionPolicy;
use crate::queue::{
    AmqpConfig, RetryPolicy, DEFAULT_PREFETCH, INITIAL_BACKOFF_MS, MAX_BACKOFF_MS, MAX_CONNECT_ATTEMPTS,
};

/// Default consumer tag prefix
pub const DEFAULT_CONSUMER_TAG: &str = "indexer-consumer";

/// Default number of consumer loops
pub const DEFAULT_WORKERS: usize = 1;

/// Configuration errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Unsupported store URL scheme `{0}` (expected mongodb, mongodb+srv, redis or rediss)")]
    UnsupportedScheme(String),
}

/// Document store backend, picked from the `STORE_URL` scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Mongo,
    Redis,
}

impl StoreBackend {
    /// Detect the backend from a connection string
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let scheme = url.split_once("://").map(|(scheme, _)| scheme).unwrap_or("");
        match scheme.to_ascii_lowercase().as_str() {
            "mongodb" | "mongodb+srv" => Ok(StoreBackend::Mongo),
            "redis" | "rediss" => Ok(StoreBackend::Redis),
            _ => Err(ConfigError::UnsupportedScheme(scheme.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Mongo => "mongodb",
            StoreBackend::Redis => "redis",
        }
    }
}

/// Document store settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub url: String,
    pub backend: StoreBackend,
    pub database: String,
    pub collection: String,
}

/// Complete consumer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub amqp: AmqpConfig,
    pub store: StoreConfig,
    pub workers: usize,
    pub persist_timeout_ms: u64,
    pub precision: PrecisionPolicy,
    pub retry: RetryPolicy,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let store_url = env.required("STORE_URL")?;
        let backend = StoreBackend::from_url(&store_url)?;

        let config = Config {
            amqp: AmqpConfig {
                url: env.required("AMQP_URL")?,
                queue: env.required("AMQP_QUEUE")?,
                consumer_tag: env
                    .optional("CONSUMER_TAG")
                    .unwrap_or_else(|| DEFAULT_CONSUMER_TAG.to_string()),
                prefetch: env.parsed("AMQP_PREFETCH", DEFAULT_PREFETCH)?,
            },
            store: StoreConfig {
                url: store_url,
                backend,
                database: env.required("STORE_DATABASE")?,
                collection: env.required("STORE_COLLECTION")?,
            },
            workers: env.parsed("CONSUMER_WORKERS", DEFAULT_WORKERS)?,
            persist_timeout_ms: env.parsed("PERSIST_TIMEOUT_MS", DEFAULT_PERSIST_TIMEOUT_MS)?,
            precision: env.parsed("NUMERIC_PRECISION", PrecisionPolicy::default())?,
            retry: RetryPolicy {
                max_attempts: env.parsed("CONNECT_MAX_ATTEMPTS", MAX_CONNECT_ATTEMPTS)?,
                initial_backoff_ms: env.parsed("CONNECT_INITIAL_BACKOFF_MS", INITIAL_BACKOFF_MS)?,
                max_backoff_ms: env.parsed("CONNECT_MAX_BACKOFF_MS", MAX_BACKOFF_MS)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the consumer cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid("CONSUMER_WORKERS", "must be at least 1"));
        }
        if self.amqp.prefetch == 0 {
            return Err(invalid("AMQP_PREFETCH", "must be at least 1"));
        }
        if self.persist_timeout_ms == 0 {
            return Err(invalid("PERSIST_TIMEOUT_MS", "must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("CONNECT_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid(
                "CONNECT_INITIAL_BACKOFF_MS",
                "must not exceed CONNECT_MAX_BACKOFF_MS",
            ));
        }
        if self.amqp.consumer_tag.is_empty() {
            return Err(invalid("CONSUMER_TAG", "cannot be empty"));
        }
        Ok(())
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Blank values count as unset
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.optional(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| invalid(key, format!("`{}`: {}", raw, e))),
            None => Ok(default),
        }
    }
}
