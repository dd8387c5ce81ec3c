//! Process-local broker.
//!
//! Implements the full broker contract (queues, round-robin consumers,
//! requeue, dead-lettering, transient reply destinations) in memory. Used by
//! the test suites and by single-process deployments.

use crate::broker::{
    Acknowledger, Broker, Delivery, DeliveryStream, ListenerTeardown, QueueOptions, ReplyHandler,
    ReplyListener,
};
use crate::envelope::{Envelope, HEADER_DEATH_REASON, HEADER_ORIGINAL_TARGET};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of every reply destination handed out by this broker.
pub const REPLY_PREFIX: &str = "reply.";

/// Counters exposed for tests and health checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub acked: u64,
    pub requeued: u64,
    /// Unsettled deliveries handed back by a dropped consumer.
    pub released: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub live_reply_listeners: usize,
}

#[derive(Default)]
struct Queue {
    options: QueueOptions,
    backlog: VecDeque<Envelope>,
    consumers: Vec<mpsc::UnboundedSender<Delivery>>,
    next_consumer: usize,
    published: u64,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    reply_listeners: HashMap<String, ReplyHandler>,
    stats: BrokerStats,
}

struct Inner {
    state: Mutex<State>,
}

/// In-memory [`Broker`].
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Snapshot of the broker counters.
    pub fn stats(&self) -> BrokerStats {
        let state = self.inner.state.lock();
        BrokerStats {
            live_reply_listeners: state.reply_listeners.len(),
            ..state.stats
        }
    }

    /// Messages waiting on `target` with no consumer attached.
    pub fn backlog_len(&self, target: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(target)
            .map_or(0, |q| q.backlog.len())
    }

    /// Total number of messages ever routed to `target`.
    pub fn published_to(&self, target: &str) -> u64 {
        self.inner
            .state
            .lock()
            .queues
            .get(target)
            .map_or(0, |q| q.published)
    }

    fn route(&self, target: &str, envelope: Envelope) {
        if target.starts_with(REPLY_PREFIX) {
            let handler = {
                let mut state = self.inner.state.lock();
                state.stats.published += 1;
                let handler = state.reply_listeners.get(target).cloned();
                if handler.is_none() {
                    state.stats.dropped += 1;
                }
                handler
            };

            match handler {
                Some(handler) => handler(envelope),
                None => debug!(
                    destination = %target,
                    correlation_id = %envelope.correlation_label(),
                    "Reply destination gone, dropping message"
                ),
            }
            return;
        }

        let mut state = self.inner.state.lock();
        state.stats.published += 1;
        enqueue(&self.inner, &mut state, target, envelope);
    }
}

/// Hand `envelope` to the next live consumer of `target`, or park it in the
/// backlog when nobody is consuming.
fn enqueue(inner: &Arc<Inner>, state: &mut State, target: &str, envelope: Envelope) {
    let queue = state.queues.entry(target.to_string()).or_default();
    queue.published += 1;

    let mut envelope = envelope;
    while !queue.consumers.is_empty() {
        let index = queue.next_consumer % queue.consumers.len();
        let delivery = Delivery::new(envelope, target, acknowledger(inner, target));
        match queue.consumers[index].send(delivery) {
            Ok(()) => {
                queue.next_consumer = index + 1;
                return;
            }
            Err(mpsc::error::SendError(returned)) => {
                queue.consumers.remove(index);
                envelope = returned.into_envelope();
            }
        }
    }

    queue.backlog.push_back(envelope);
}

fn acknowledger(inner: &Arc<Inner>, source: &str) -> Arc<dyn Acknowledger> {
    Arc::new(MemoryAcknowledger {
        inner: Arc::downgrade(inner),
        source: source.to_string(),
    })
}

struct MemoryAcknowledger {
    inner: Weak<Inner>,
    source: String,
}

impl MemoryAcknowledger {
    fn upgrade(&self) -> BrokerResult<Arc<Inner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| BrokerError::Closed("in-memory broker dropped".to_string()))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self, _envelope: &Envelope) -> BrokerResult<()> {
        let inner = self.upgrade()?;
        inner.state.lock().stats.acked += 1;
        Ok(())
    }

    async fn reject(&self, envelope: &Envelope, requeue: bool) -> BrokerResult<()> {
        let inner = self.upgrade()?;
        let mut state = inner.state.lock();

        if requeue {
            state.stats.requeued += 1;
            let mut again = envelope.clone();
            again.redelivered = true;
            enqueue(&inner, &mut state, &self.source, again);
            return Ok(());
        }

        let dead_letter_target = state
            .queues
            .get(&self.source)
            .and_then(|q| q.options.dead_letter_target.clone());

        match dead_letter_target {
            Some(dlq) => {
                let mut dead = envelope.clone();
                dead.redelivered = false;
                dead.set_header_if_absent(HEADER_ORIGINAL_TARGET, self.source.as_str());
                dead.set_header(HEADER_DEATH_REASON, "rejected");
                state.stats.dead_lettered += 1;
                debug!(
                    source = %self.source,
                    dead_letter_target = %dlq,
                    correlation_id = %envelope.correlation_label(),
                    "Dead-lettering rejected message"
                );
                enqueue(&inner, &mut state, &dlq, dead);
            }
            None => {
                state.stats.dropped += 1;
                warn!(
                    source = %self.source,
                    correlation_id = %envelope.correlation_label(),
                    "Rejected message has no dead-letter target, dropping"
                );
            }
        }

        Ok(())
    }

    fn release(&self, envelope: &Envelope) {
        // Broker already gone: nothing left to redeliver to.
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock();
        state.stats.released += 1;
        debug!(
            source = %self.source,
            correlation_id = %envelope.correlation_label(),
            "Unsettled delivery dropped, redelivering"
        );
        let mut again = envelope.clone();
        again.redelivered = true;
        enqueue(&inner, &mut state, &self.source, again);
    }
}

struct MemoryTeardown {
    inner: Weak<Inner>,
    destination: String,
}

impl ListenerTeardown for MemoryTeardown {
    fn teardown(self: Box<Self>) -> BrokerResult<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| BrokerError::Closed("in-memory broker dropped".to_string()))?;
        let removed = inner.state.lock().reply_listeners.remove(&self.destination);
        match removed {
            Some(_) => Ok(()),
            None => Err(BrokerError::Closed(format!(
                "reply destination {} not registered",
                self.destination
            ))),
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, target: &str, options: QueueOptions) -> BrokerResult<()> {
        let mut state = self.inner.state.lock();
        state.queues.entry(target.to_string()).or_default().options = options;
        Ok(())
    }

    async fn publish(&self, target: &str, envelope: Envelope) -> BrokerResult<()> {
        self.route(target, envelope);
        Ok(())
    }

    async fn consume(&self, target: &str) -> BrokerResult<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        let queue = state.queues.entry(target.to_string()).or_default();

        while let Some(envelope) = queue.backlog.pop_front() {
            let delivery = Delivery::new(envelope, target, acknowledger(&self.inner, target));
            if let Err(mpsc::error::SendError(returned)) = tx.send(delivery) {
                queue.backlog.push_front(returned.into_envelope());
                break;
            }
        }
        queue.consumers.push(tx);

        debug!(target = %target, consumers = queue.consumers.len(), "Consumer attached");
        Ok(DeliveryStream::new(rx))
    }

    async fn open_reply_listener(&self, handler: ReplyHandler) -> BrokerResult<ReplyListener> {
        let destination = format!("{REPLY_PREFIX}{}", Uuid::new_v4());
        self.inner
            .state
            .lock()
            .reply_listeners
            .insert(destination.clone(), handler);

        Ok(ReplyListener::new(
            destination.clone(),
            Box::new(MemoryTeardown {
                inner: Arc::downgrade(&self.inner),
                destination,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn backlog_is_drained_by_late_consumer() {
        let broker = InMemoryBroker::new();
        broker.publish("orders", Envelope::new(b"1".to_vec())).await.unwrap();
        broker.publish("orders", Envelope::new(b"2".to_vec())).await.unwrap();
        assert_eq!(broker.backlog_len("orders"), 2);

        let mut stream = broker.consume("orders").await.unwrap();
        assert_eq!(stream.next().await.unwrap().envelope.payload, b"1");
        assert_eq!(stream.next().await.unwrap().envelope.payload, b"2");
        assert_eq!(broker.backlog_len("orders"), 0);
    }

    #[tokio::test]
    async fn consumers_receive_round_robin() {
        let broker = InMemoryBroker::new();
        let mut a = broker.consume("jobs").await.unwrap();
        let mut b = broker.consume("jobs").await.unwrap();

        for i in 0..4u8 {
            broker.publish("jobs", Envelope::new(vec![i])).await.unwrap();
        }

        assert_eq!(a.next().await.unwrap().envelope.payload, vec![0]);
        assert_eq!(b.next().await.unwrap().envelope.payload, vec![1]);
        assert_eq!(a.next().await.unwrap().envelope.payload, vec![2]);
        assert_eq!(b.next().await.unwrap().envelope.payload, vec![3]);
    }

    #[tokio::test]
    async fn dropped_consumer_is_skipped() {
        let broker = InMemoryBroker::new();
        let dropped = broker.consume("jobs").await.unwrap();
        let mut live = broker.consume("jobs").await.unwrap();
        drop(dropped);

        broker.publish("jobs", Envelope::new(vec![9])).await.unwrap();
        assert_eq!(live.next().await.unwrap().envelope.payload, vec![9]);
    }

    #[tokio::test]
    async fn reject_without_requeue_dead_letters_with_original_target() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue("cv.save", QueueOptions::dead_letter_to("cv.save.dlq"))
            .await
            .unwrap();

        let mut requests = broker.consume("cv.save").await.unwrap();
        let mut dlq = broker.consume("cv.save.dlq").await.unwrap();

        broker
            .publish("cv.save", Envelope::new(b"x".to_vec()).with_correlation_id("c-1"))
            .await
            .unwrap();
        requests.next().await.unwrap().reject(false).await.unwrap();

        let dead = dlq.next().await.unwrap();
        assert_eq!(dead.envelope.header_str(HEADER_ORIGINAL_TARGET), Some("cv.save"));
        assert_eq!(dead.envelope.header_str(HEADER_DEATH_REASON), Some("rejected"));
        assert_eq!(dead.envelope.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(broker.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn reject_with_requeue_redelivers() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.consume("q").await.unwrap();
        broker.publish("q", Envelope::new(b"x".to_vec())).await.unwrap();

        let first = stream.next().await.unwrap();
        assert!(!first.envelope.redelivered);
        first.reject(true).await.unwrap();

        let second = stream.next().await.unwrap();
        assert!(second.envelope.redelivered);
        second.ack().await.unwrap();
        assert_eq!(broker.stats().acked, 1);
        assert_eq!(broker.stats().requeued, 1);
    }

    #[tokio::test]
    async fn unsettled_delivery_is_redelivered_when_dropped() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.consume("q").await.unwrap();
        broker.publish("q", Envelope::new(b"x".to_vec())).await.unwrap();

        drop(stream.next().await.unwrap());

        let again = stream.next().await.unwrap();
        assert!(again.envelope.redelivered);
        assert_eq!(again.envelope.payload, b"x");
        again.ack().await.unwrap();
        assert_eq!(broker.stats().released, 1);
    }

    #[tokio::test]
    async fn buffered_deliveries_survive_a_dropped_consumer() {
        let broker = InMemoryBroker::new();
        let stream = broker.consume("q").await.unwrap();
        broker.publish("q", Envelope::new(b"1".to_vec())).await.unwrap();
        broker.publish("q", Envelope::new(b"2".to_vec())).await.unwrap();

        drop(stream);
        assert_eq!(broker.backlog_len("q"), 2);

        let mut stream = broker.consume("q").await.unwrap();
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert!(first.envelope.redelivered && second.envelope.redelivered);
        let mut payloads = vec![first.envelope.payload.clone(), second.envelope.payload.clone()];
        payloads.sort();
        assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test]
    async fn settled_deliveries_are_not_released() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.consume("q").await.unwrap();
        broker.publish("q", Envelope::new(vec![])).await.unwrap();
        stream.next().await.unwrap().ack().await.unwrap();
        drop(stream);

        assert_eq!(broker.stats().released, 0);
        assert_eq!(broker.backlog_len("q"), 0);
    }

    #[tokio::test]
    async fn reject_without_dead_letter_target_drops() {
        let broker = InMemoryBroker::new();
        let mut stream = broker.consume("plain").await.unwrap();
        broker.publish("plain", Envelope::new(vec![])).await.unwrap();
        stream.next().await.unwrap().reject(false).await.unwrap();
        assert_eq!(broker.stats().dropped, 1);
    }

    #[tokio::test]
    async fn reply_listener_receives_until_closed() {
        let broker = InMemoryBroker::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let listener = broker
            .open_reply_listener(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        let destination = listener.destination().to_string();
        assert!(destination.starts_with(REPLY_PREFIX));
        assert_eq!(broker.stats().live_reply_listeners, 1);

        broker.publish(&destination, Envelope::new(vec![])).await.unwrap();
        listener.close().unwrap();
        broker.publish(&destination, Envelope::new(vec![])).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(broker.stats().live_reply_listeners, 0);
        assert_eq!(broker.stats().dropped, 1);
    }
}
