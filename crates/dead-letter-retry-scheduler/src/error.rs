//! Error types for the retry scheduler.

use broker_transport::BrokerError;
use thiserror::Error;

/// Scheduler error type.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Broker declare/consume failure while starting up
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Invalid routes or settings
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
