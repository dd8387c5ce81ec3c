//! Error types for the broker transport.

use thiserror::Error;

/// Broker transport error.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Envelope could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker or the consumer channel has shut down
    #[error("Broker closed: {0}")]
    Closed(String),

    /// Unexpected data on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
