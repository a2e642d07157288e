//! Error types for keygate.

use thiserror::Error;

/// Main error type for keygate operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Limiter construction failed: a parameter is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The request key failed validation. No backend state was touched.
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    /// The backend could not be reached or the operation timed out.
    /// Callers should fail closed and deny the request.
    #[error("backend unavailable: {0}")]
    Backend(#[from] redis::RedisError),

    /// A stored payload could not be parsed. Operators can recover by
    /// deleting the affected key.
    #[error("malformed state at key {key}: {detail}")]
    MalformedState { key: String, detail: String },
}

/// Result type alias for keygate operations.
pub type Result<T> = std::result::Result<T, Error>;
