//! Error types for the RPC client.

use broker_transport::BrokerError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to an RPC caller. Raw transport failures are wrapped,
/// never passed through.
#[derive(Error, Debug)]
pub enum RpcError {
    /// No reply arrived before the deadline
    #[error("Timeout after {after:?} waiting for reply {correlation_id} from {target}")]
    Timeout {
        target: String,
        correlation_id: String,
        after: Duration,
    },

    /// Publishing the request or managing the reply listener failed
    #[error("Transport error: {0}")]
    Transport(#[from] BrokerError),

    /// The request could not be encoded, or the reply was not a reply body
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The reply decoded but did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The responder replayed a previously recorded failure
    #[error("Permanent failure: {0}")]
    PermanentFailure(String),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

/// Result type for RPC calls.
pub type RpcResult<T> = Result<T, RpcError>;
