//! Error types for the relay daemon.

use thiserror::Error;

/// Relay daemon error type.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Missing or malformed configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for relay daemon operations.
pub type RelayResult<T> = Result<T, RelayError>;
