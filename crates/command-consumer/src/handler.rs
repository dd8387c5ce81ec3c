//! Business logic seam.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// How an execution of business logic failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Retrying cannot help. Recorded and replayed to every redelivery.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// May succeed later. The message is dead-lettered for a delayed retry.
    #[error("transient failure: {0}")]
    Transient(String),
}

/// Business logic run at most once per idempotency key.
///
/// Receives the raw request payload and returns the JSON-encoded result.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &[u8]) -> Result<Vec<u8>, HandlerError>;
}

#[async_trait]
impl<H: CommandHandler + ?Sized> CommandHandler for Arc<H> {
    async fn handle(&self, payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        (**self).handle(payload).await
    }
}
