//! The broker contract shared by all backends.

use crate::envelope::Envelope;
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Callback invoked for every envelope arriving on a reply destination.
///
/// Runs on the broker's dispatch path, so it must not block.
pub type ReplyHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Per-queue routing options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Where rejected (non-requeued) messages are rerouted.
    pub dead_letter_target: Option<String>,
}

impl QueueOptions {
    pub fn dead_letter_to(target: impl Into<String>) -> Self {
        Self {
            dead_letter_target: Some(target.into()),
        }
    }
}

/// Settles a delivery with the broker that produced it.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Remove the message from the queue.
    async fn ack(&self, envelope: &Envelope) -> BrokerResult<()>;

    /// Negatively acknowledge. `requeue = false` dead-letters the message when
    /// the queue has a dead-letter target.
    async fn reject(&self, envelope: &Envelope, requeue: bool) -> BrokerResult<()>;

    /// The delivery was dropped without being settled (consumer gone, task
    /// cancelled or panicked). The message must become deliverable again.
    /// Runs inside `Drop`, so it must not block.
    fn release(&self, envelope: &Envelope);
}

/// A message handed to a consumer, to be settled exactly once.
///
/// Dropping an unsettled delivery hands it back to the broker for
/// redelivery, so a crashed or cancelled consumer never loses a message.
pub struct Delivery {
    pub envelope: Envelope,
    /// Target the message was consumed from.
    pub source: String,
    acknowledger: Arc<dyn Acknowledger>,
    settled: bool,
}

impl Delivery {
    pub fn new(envelope: Envelope, source: impl Into<String>, acknowledger: Arc<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            source: source.into(),
            acknowledger,
            settled: false,
        }
    }

    pub async fn ack(mut self) -> BrokerResult<()> {
        self.settled = true;
        self.acknowledger.ack(&self.envelope).await
    }

    pub async fn reject(mut self, requeue: bool) -> BrokerResult<()> {
        self.settled = true;
        self.acknowledger.reject(&self.envelope, requeue).await
    }

    /// Take the envelope back without settling or releasing it. For brokers
    /// that reroute a delivery their consumer never received.
    pub fn into_envelope(mut self) -> Envelope {
        self.settled = true;
        std::mem::replace(&mut self.envelope, Envelope::new(Vec::new()))
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            self.acknowledger.release(&self.envelope);
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one `consume` call.
pub struct DeliveryStream {
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryStream {
    pub fn new(receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { receiver }
    }

    /// Next delivery, or `None` once the broker stopped feeding this consumer.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// Backend-specific teardown of a reply destination.
pub trait ListenerTeardown: Send + Sync {
    fn teardown(self: Box<Self>) -> BrokerResult<()>;
}

/// A temporary, exclusive reply destination.
///
/// Torn down by [`ReplyListener::close`], or on drop if never closed, so no
/// exit path leaks the destination.
pub struct ReplyListener {
    destination: String,
    teardown: Option<Box<dyn ListenerTeardown>>,
}

impl ReplyListener {
    pub fn new(destination: String, teardown: Box<dyn ListenerTeardown>) -> Self {
        Self {
            destination,
            teardown: Some(teardown),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Tear the destination down and report the outcome.
    pub fn close(mut self) -> BrokerResult<()> {
        match self.teardown.take() {
            Some(teardown) => teardown.teardown(),
            None => Err(BrokerError::Closed(format!(
                "reply listener {} already closed",
                self.destination
            ))),
        }
    }
}

impl Drop for ReplyListener {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            if let Err(e) = teardown.teardown() {
                warn!(
                    destination = %self.destination,
                    error = %e,
                    "Failed to tear down reply listener on drop"
                );
            }
        }
    }
}

/// A message broker offering at-least-once delivery, headers, correlation
/// ids, reply destinations and dead-lettering.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declare a queue and its routing options. Safe to repeat.
    async fn declare_queue(&self, target: &str, options: QueueOptions) -> BrokerResult<()>;

    /// Publish an envelope to `target`.
    async fn publish(&self, target: &str, envelope: Envelope) -> BrokerResult<()>;

    /// Start consuming `target`.
    async fn consume(&self, target: &str) -> BrokerResult<DeliveryStream>;

    /// Create a fresh reply destination whose envelopes are passed to
    /// `handler` until the returned listener is torn down.
    async fn open_reply_listener(&self, handler: ReplyHandler) -> BrokerResult<ReplyListener>;
}

#[async_trait]
impl<B: Broker + ?Sized> Broker for Arc<B> {
    async fn declare_queue(&self, target: &str, options: QueueOptions) -> BrokerResult<()> {
        (**self).declare_queue(target, options).await
    }

    async fn publish(&self, target: &str, envelope: Envelope) -> BrokerResult<()> {
        (**self).publish(target, envelope).await
    }

    async fn consume(&self, target: &str) -> BrokerResult<DeliveryStream> {
        (**self).consume(target).await
    }

    async fn open_reply_listener(&self, handler: ReplyHandler) -> BrokerResult<ReplyListener> {
        (**self).open_reply_listener(handler).await
    }
}
