//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The Redis URL may carry credentials, so it is wrapped in
//! secrecy::SecretString to keep it out of logs.

use std::str::FromStr;

use crate::error::{Error, Result};
use crate::queue::QueueOptions;
use secrecy::SecretString;

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub namespace: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub visibility_timeout_ms: Option<i64>,
    pub max_attempts: Option<u32>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            redis_url: SecretString::from(required_var("REDIS_URL")?),
            namespace: std::env::var("GROUPQ_NAMESPACE")
                .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string()),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            visibility_timeout_ms: optional_var("GROUPQ_VISIBILITY_TIMEOUT_MS")?,
            max_attempts: optional_var("GROUPQ_MAX_ATTEMPTS")?,
        })
    }

    /// Queue options with the configured overrides applied.
    pub fn queue_options(&self) -> QueueOptions {
        let defaults = QueueOptions::default();
        QueueOptions {
            visibility_timeout_ms: self
                .visibility_timeout_ms
                .unwrap_or(defaults.visibility_timeout_ms),
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            ..defaults
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value {raw:?} for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
