//! Error types for the idempotency gate.

use thiserror::Error;

/// Idempotency gate error.
#[derive(Error, Debug)]
pub enum GateError {
    /// The backing store failed
    #[error("Store error: {0}")]
    Store(String),

    /// A stored record could not be decoded
    #[error("Corrupt idempotency record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<redis::RedisError> for GateError {
    fn from(err: redis::RedisError) -> Self {
        GateError::Store(err.to_string())
    }
}

/// Result type for gate operations.
pub type GateResult<T> = Result<T, GateError>;
