//! Error types for groupq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The payload could not be serialized; nothing was written.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unexpected store reply: {0}")]
    Protocol(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
