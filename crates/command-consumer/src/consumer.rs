//! Command consumption through the idempotency gate.

use crate::error::ConsumerResult;
use crate::handler::{CommandHandler, HandlerError};
use broker_transport::{Broker, Delivery, Envelope, QueueOptions};
use futures_util::FutureExt;
use idempotency_gate::{idempotency_key, IdempotencyGate, IdempotencyStore};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use sync_rpc_client::{ReplyBody, ReplyErrorKind};
use tracing::{debug, info, warn};

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Business logic ran and succeeded; result recorded and replied.
    Executed,
    /// A recorded result was replayed.
    CachedResult,
    /// A recorded failure was replayed.
    CachedFailure,
    /// Business logic ran and failed permanently; failure recorded and replied.
    PermanentFailure,
    /// Another delivery holds the claim; rejected without executing.
    ConcurrentDuplicate,
    /// Rejected without requeue so the broker dead-letters it.
    DeadLettered,
    /// No correlation id; rejected without requeue.
    Malformed,
}

enum Settle {
    Reply(ReplyBody, ConsumeOutcome),
    Reject(ConsumeOutcome),
}

/// Consumes one operation's request target.
///
/// Per delivery: replay a recorded failure, else replay a recorded result,
/// else claim the key and run the handler exactly once. Anything that cannot
/// be answered is rejected without requeue, which dead-letters it into the
/// retry scheduler.
pub struct CommandConsumer<B, S, H> {
    broker: B,
    gate: IdempotencyGate<S>,
    handler: H,
    operation: String,
    request_target: String,
    dead_letter_target: String,
}

impl<B, S, H> CommandConsumer<B, S, H>
where
    B: Broker,
    S: IdempotencyStore + 'static,
    H: CommandHandler,
{
    /// Consumer for `operation`, reading the target of the same name and
    /// dead-lettering to `<operation>.dlq`.
    pub fn new(operation: impl Into<String>, broker: B, gate: IdempotencyGate<S>, handler: H) -> Self {
        let operation = operation.into();
        Self {
            broker,
            gate,
            handler,
            request_target: operation.clone(),
            dead_letter_target: format!("{operation}.dlq"),
            operation,
        }
    }

    pub fn with_request_target(mut self, target: impl Into<String>) -> Self {
        self.request_target = target.into();
        self
    }

    pub fn with_dead_letter_target(mut self, target: impl Into<String>) -> Self {
        self.dead_letter_target = target.into();
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn gate(&self) -> &IdempotencyGate<S> {
        &self.gate
    }

    /// Declare the request target with its dead-letter routing and handle
    /// every delivery on its own task until the stream ends.
    pub async fn run(self: Arc<Self>) -> ConsumerResult<()> {
        self.broker
            .declare_queue(
                &self.request_target,
                QueueOptions::dead_letter_to(self.dead_letter_target.clone()),
            )
            .await?;
        let mut stream = self.broker.consume(&self.request_target).await?;
        info!(
            operation = %self.operation,
            request_target = %self.request_target,
            dead_letter_target = %self.dead_letter_target,
            "Command consumer started"
        );

        while let Some(delivery) = stream.next().await {
            let consumer = self.clone();
            tokio::spawn(async move {
                consumer.handle_delivery(delivery).await;
            });
        }

        warn!(operation = %self.operation, "Request stream closed");
        Ok(())
    }

    /// Process and settle one delivery.
    pub async fn handle_delivery(&self, delivery: Delivery) -> ConsumeOutcome {
        let Some(correlation_id) = delivery.envelope.correlation_id.clone() else {
            warn!(
                operation = %self.operation,
                message_id = %delivery.envelope.message_id,
                "Command without correlation id, rejecting"
            );
            self.reject(delivery).await;
            return ConsumeOutcome::Malformed;
        };
        let key = idempotency_key(&self.operation, &correlation_id);

        let settle = match self.process(&key, &correlation_id, &delivery.envelope).await {
            Ok(settle) => settle,
            Err(e) => {
                warn!(
                    correlation_id = %correlation_id,
                    operation = %self.operation,
                    error = %e,
                    "Command processing failed, dead-lettering"
                );
                Settle::Reject(ConsumeOutcome::DeadLettered)
            }
        };

        match settle {
            Settle::Reject(outcome) => {
                self.reject(delivery).await;
                outcome
            }
            Settle::Reply(body, outcome) => match self.reply(&delivery.envelope, &correlation_id, &body).await {
                Ok(()) => {
                    if let Err(e) = delivery.ack().await {
                        warn!(correlation_id = %correlation_id, operation = %self.operation, error = %e, "Failed to ack command");
                    }
                    outcome
                }
                Err(e) => {
                    // The outcome is recorded; the redelivery replays it.
                    warn!(
                        correlation_id = %correlation_id,
                        operation = %self.operation,
                        error = %e,
                        "Failed to publish reply, dead-lettering"
                    );
                    self.reject(delivery).await;
                    ConsumeOutcome::DeadLettered
                }
            },
        }
    }

    async fn process(&self, key: &str, correlation_id: &str, envelope: &Envelope) -> ConsumerResult<Settle> {
        if let Some(error) = self.gate.check_failure(key).await? {
            info!(
                correlation_id = %correlation_id,
                operation = %self.operation,
                state = "idempotent_hit",
                cached = "failure",
                "Replaying recorded failure"
            );
            return Ok(Settle::Reply(
                ReplyBody::error(ReplyErrorKind::PermanentFailure, error),
                ConsumeOutcome::CachedFailure,
            ));
        }

        if let Some(result) = self.gate.check_cached(key).await? {
            info!(
                correlation_id = %correlation_id,
                operation = %self.operation,
                state = "idempotent_hit",
                cached = "result",
                "Replaying recorded result"
            );
            return Ok(Settle::Reply(ReplyBody::ok(result), ConsumeOutcome::CachedResult));
        }

        if !self.gate.claim_first(key).await? {
            warn!(
                correlation_id = %correlation_id,
                operation = %self.operation,
                state = "claim_rejected",
                "Command already claimed, rejecting duplicate"
            );
            return Ok(Settle::Reject(ConsumeOutcome::ConcurrentDuplicate));
        }
        debug!(correlation_id = %correlation_id, operation = %self.operation, state = "claimed", "Command claimed");

        // A panicking handler is treated as a transient failure so the
        // claim is released and the command dead-letters.
        let handled = AssertUnwindSafe(self.handler.handle(&envelope.payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(HandlerError::Transient(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match handled {
            Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(result) => {
                    self.gate.record_success(key, &result).await?;
                    info!(
                        correlation_id = %correlation_id,
                        operation = %self.operation,
                        state = "executed",
                        "Command executed"
                    );
                    Ok(Settle::Reply(ReplyBody::ok(result), ConsumeOutcome::Executed))
                }
                Err(e) => {
                    let message = format!("handler returned a non-JSON result: {e}");
                    self.permanent_failure(key, correlation_id, message).await
                }
            },
            Err(HandlerError::Permanent(message)) => self.permanent_failure(key, correlation_id, message).await,
            Err(HandlerError::Transient(message)) => {
                warn!(
                    correlation_id = %correlation_id,
                    operation = %self.operation,
                    state = "failed",
                    transient = true,
                    error = %message,
                    "Command failed transiently, releasing claim"
                );
                self.gate.release(key).await?;
                Ok(Settle::Reject(ConsumeOutcome::DeadLettered))
            }
        }
    }

    async fn permanent_failure(&self, key: &str, correlation_id: &str, message: String) -> ConsumerResult<Settle> {
        self.gate.record_failure(key, &message).await?;
        warn!(
            correlation_id = %correlation_id,
            operation = %self.operation,
            state = "failed",
            transient = false,
            error = %message,
            "Command failed permanently"
        );
        Ok(Settle::Reply(
            ReplyBody::error(ReplyErrorKind::PermanentFailure, message),
            ConsumeOutcome::PermanentFailure,
        ))
    }

    /// Commands without a reply destination are fire-and-forget.
    async fn reply(&self, request: &Envelope, correlation_id: &str, body: &ReplyBody) -> ConsumerResult<()> {
        let Some(reply_to) = request.reply_to.as_deref() else {
            return Ok(());
        };
        let reply = Envelope::new(body.encode()?).with_correlation_id(correlation_id);
        self.broker.publish(reply_to, reply).await?;
        Ok(())
    }

    async fn reject(&self, delivery: Delivery) {
        let correlation_id = delivery.envelope.correlation_label().to_string();
        if let Err(e) = delivery.reject(false).await {
            warn!(
                correlation_id = %correlation_id,
                operation = %self.operation,
                error = %e,
                "Failed to reject command"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
