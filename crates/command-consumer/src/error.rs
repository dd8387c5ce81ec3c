//! Error types for the command consumer.

use broker_transport::BrokerError;
use idempotency_gate::GateError;
use thiserror::Error;

/// Consumer error type.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Declare, consume or reply publish failure
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Idempotency store failure
    #[error("Idempotency gate error: {0}")]
    Gate(#[from] GateError),

    /// Reply body could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for consumer operations.
pub type ConsumerResult<T> = Result<T, ConsumerError>;
