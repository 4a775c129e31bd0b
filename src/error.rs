//! Error types for the Slidegate limiter.

use thiserror::Error;

/// Main error type for Slidegate operations.
///
/// Only construction and configuration can fail. Admission checks never
/// return an error; backend trouble is absorbed at the store boundary.
#[derive(Error, Debug)]
pub enum SlidegateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while reading layered configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// The window must be at least one whole second
    #[error("Invalid window: must be at least one second")]
    InvalidWindow,

    /// The in-process store needs at least one shard
    #[error("Invalid shard count: must be at least one")]
    InvalidShardCount,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Slidegate operations.
pub type Result<T> = std::result::Result<T, SlidegateError>;

/// Errors reported by an external key-value backend.
///
/// These never escape [`ExternalStore`](crate::ratelimit::ExternalStore);
/// they are logged and turned into "no history" for the key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer in time
    #[error("Backend timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Other(String),
}
