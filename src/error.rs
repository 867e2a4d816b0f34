//! Error types for Quotagate.

use thiserror::Error;

/// Main error type for Quotagate operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy that cannot produce meaningful quota behavior
    #[error("Invalid rate limit policy: {0}")]
    InvalidPolicy(String),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Redis errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for QuotaError {
    fn from(err: ::config::ConfigError) -> Self {
        QuotaError::Config(err.to_string())
    }
}

/// Result type alias for Quotagate operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
