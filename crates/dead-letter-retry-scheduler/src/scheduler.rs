//! Dead-letter consumption, deferred republish and quarantine.

use crate::alert::{payload_preview, AlertSink, LogAlertSink, PoisonAlert};
use crate::config::{validate, OperationRoute, RetrySchedulerConfig};
use crate::error::SchedulerResult;
use crate::handle::{stopped, SchedulerHandle};
use crate::policy::{decide, original_target, poisoned, retry_count, RetryDecision, HEADER_RETRY_COUNT};
use broker_transport::{Broker, Delivery, DeliveryStream, Envelope, QueueOptions};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Drains every operation's dead-letter target and decides, per message,
/// between a delayed republish and quarantine.
pub struct RetryScheduler<B> {
    broker: B,
    config: RetrySchedulerConfig,
    routes: Vec<OperationRoute>,
    alerts: Arc<dyn AlertSink>,
}

impl<B: Broker> RetryScheduler<B> {
    pub fn new(broker: B, config: RetrySchedulerConfig, routes: Vec<OperationRoute>) -> Self {
        Self {
            broker,
            config,
            routes,
            alerts: Arc::new(LogAlertSink),
        }
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn routes(&self) -> &[OperationRoute] {
        &self.routes
    }

    /// Declare request targets with their dead-letter routing, the
    /// dead-letter targets and the poison target.
    pub async fn declare_topology(&self) -> SchedulerResult<()> {
        for route in &self.routes {
            self.broker
                .declare_queue(
                    &route.request_target,
                    QueueOptions::dead_letter_to(route.dead_letter_target.clone()),
                )
                .await?;
            self.broker
                .declare_queue(&route.dead_letter_target, QueueOptions::default())
                .await?;
        }
        self.broker
            .declare_queue(&self.config.poison_target, QueueOptions::default())
            .await?;
        Ok(())
    }

    /// Validate the routes, declare the topology and start one consumption
    /// loop per dead-letter target.
    pub async fn start(self) -> SchedulerResult<SchedulerHandle> {
        validate(&self.config, &self.routes)?;
        self.declare_topology().await?;

        let mut streams = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let stream = self.broker.consume(&route.dead_letter_target).await?;
            streams.push((route.clone(), stream));
        }

        let worker = Arc::new(Worker {
            broker: self.broker,
            config: self.config,
            alerts: self.alerts,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = streams
            .into_iter()
            .map(|(route, stream)| {
                info!(
                    operation = %route.operation,
                    dead_letter_target = %route.dead_letter_target,
                    "Retry scheduler consuming dead letters"
                );
                tokio::spawn(drain(worker.clone(), route, stream, shutdown_rx.clone()))
            })
            .collect();

        Ok(SchedulerHandle::new(shutdown_tx, tasks))
    }
}

struct Worker<B> {
    broker: B,
    config: RetrySchedulerConfig,
    alerts: Arc<dyn AlertSink>,
}

async fn drain<B: Broker>(
    worker: Arc<Worker<B>>,
    route: OperationRoute,
    mut stream: DeliveryStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let route = Arc::new(route);
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            next = stream.next() => match next {
                Some(delivery) => worker.handle(&route, delivery).await,
                None => {
                    warn!(
                        operation = %route.operation,
                        dead_letter_target = %route.dead_letter_target,
                        "Dead-letter stream closed"
                    );
                    break;
                }
            },
        }
    }
    debug!(operation = %route.operation, "Retry scheduler loop exited");
}

impl<B: Broker> Worker<B> {
    /// Never waits out a backoff delay: retries are handed to a spawned task
    /// so the loop keeps draining.
    async fn handle(self: &Arc<Self>, route: &Arc<OperationRoute>, delivery: Delivery) {
        match decide(route, &delivery.envelope, &self.config, Utc::now()) {
            RetryDecision::Retry { delay, next } => {
                let target = original_target(route, &delivery.envelope).to_string();
                info!(
                    correlation_id = %delivery.envelope.correlation_label(),
                    operation = %route.operation,
                    state = "retry_scheduled",
                    retry_count = next.header_int(HEADER_RETRY_COUNT).unwrap_or_default(),
                    delay_ms = delay.as_millis() as u64,
                    target = %target,
                    "Retry scheduled"
                );
                let worker = self.clone();
                let route = route.clone();
                tokio::spawn(async move {
                    worker.republish_after(&route, delivery, &target, next, delay).await;
                });
            }
            RetryDecision::Quarantine { reason } => self.quarantine(route, delivery, reason).await,
        }
    }

    async fn republish_after(
        &self,
        route: &OperationRoute,
        delivery: Delivery,
        target: &str,
        next: Envelope,
        delay: Duration,
    ) {
        tokio::time::sleep(delay).await;

        match self.broker.publish(target, next).await {
            Ok(()) => {
                debug!(
                    correlation_id = %delivery.envelope.correlation_label(),
                    operation = %route.operation,
                    target = %target,
                    "Retry republished"
                );
                if let Err(e) = delivery.ack().await {
                    warn!(operation = %route.operation, error = %e, "Failed to ack dead letter");
                }
            }
            Err(e) => {
                warn!(
                    correlation_id = %delivery.envelope.correlation_label(),
                    operation = %route.operation,
                    target = %target,
                    error = %e,
                    "Retry republish failed"
                );
                let reason = format!("republish to {target} failed: {e}");
                self.quarantine(route, delivery, reason).await;
            }
        }
    }

    async fn quarantine(&self, route: &OperationRoute, delivery: Delivery, reason: String) {
        let envelope = &delivery.envelope;
        let alert = PoisonAlert {
            operation: route.operation.clone(),
            correlation_id: envelope.correlation_label().to_string(),
            reason,
            retry_count: retry_count(envelope).unwrap_or_default(),
            payload_preview: payload_preview(&envelope.payload, self.config.preview_len),
        };
        let poison = poisoned(route, envelope, &alert.reason, &alert.message(), Utc::now());

        match self.broker.publish(&self.config.poison_target, poison).await {
            Ok(()) => {
                warn!(
                    correlation_id = %alert.correlation_id,
                    operation = %alert.operation,
                    state = "quarantined",
                    retry_count = alert.retry_count,
                    reason = %alert.reason,
                    poison_target = %self.config.poison_target,
                    "Message quarantined"
                );
                self.alerts.alert(&alert);
                if let Err(e) = delivery.ack().await {
                    warn!(operation = %route.operation, error = %e, "Failed to ack dead letter");
                }
            }
            Err(e) => {
                // Back onto the dead-letter target after a pause. The next
                // decision is made afresh from the retry count: an exhausted
                // message quarantines again, one that only failed to
                // republish is retried.
                error!(
                    correlation_id = %alert.correlation_id,
                    operation = %alert.operation,
                    error = %e,
                    "Failed to publish to poison target, requeueing dead letter"
                );
                let pause = self.config.base_delay;
                let operation = alert.operation;
                tokio::spawn(async move {
                    tokio::time::sleep(pause).await;
                    if let Err(e) = delivery.reject(true).await {
                        error!(operation = %operation, error = %e, "Failed to requeue dead letter");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{HEADER_FIRST_FAILURE_AT, HEADER_POISON_OPERATION, HEADER_POISON_REASON};
    use async_trait::async_trait;
    use broker_transport::{
        BrokerError, BrokerResult, InMemoryBroker, ReplyHandler, ReplyListener,
    };
    use parking_lot::Mutex;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct RecordingAlertSink {
        alerts: Mutex<Vec<PoisonAlert>>,
    }

    impl AlertSink for RecordingAlertSink {
        fn alert(&self, alert: &PoisonAlert) {
            self.alerts.lock().push(alert.clone());
        }
    }

    /// In-memory broker whose publishes to one target always fail.
    #[derive(Clone)]
    struct FailingTarget {
        inner: InMemoryBroker,
        failing: String,
    }

    #[async_trait]
    impl Broker for FailingTarget {
        async fn declare_queue(&self, target: &str, options: QueueOptions) -> BrokerResult<()> {
            self.inner.declare_queue(target, options).await
        }

        async fn publish(&self, target: &str, envelope: Envelope) -> BrokerResult<()> {
            if target == self.failing {
                return Err(BrokerError::Closed(format!("{target} unavailable")));
            }
            self.inner.publish(target, envelope).await
        }

        async fn consume(&self, target: &str) -> BrokerResult<DeliveryStream> {
            self.inner.consume(target).await
        }

        async fn open_reply_listener(&self, handler: ReplyHandler) -> BrokerResult<ReplyListener> {
            self.inner.open_reply_listener(handler).await
        }
    }

    fn fast_config() -> RetrySchedulerConfig {
        RetrySchedulerConfig {
            base_delay: Duration::from_millis(5),
            max_retries: 3,
            ..Default::default()
        }
    }

    fn routes() -> Vec<OperationRoute> {
        vec![OperationRoute::new("account.create")]
    }

    #[tokio::test]
    async fn dead_letter_is_republished_with_incremented_count() {
        let broker = InMemoryBroker::new();
        let handle = RetryScheduler::new(broker.clone(), fast_config(), routes())
            .start()
            .await
            .unwrap();
        let mut requests = broker.consume("account.create").await.unwrap();

        broker
            .publish(
                "account.create",
                Envelope::new(b"{}".to_vec())
                    .with_correlation_id("abc-1")
                    .with_header("tenant", "acme"),
            )
            .await
            .unwrap();
        requests.next().await.unwrap().reject(false).await.unwrap();

        let retried = timeout(WAIT, requests.next()).await.unwrap().unwrap();
        assert_eq!(retried.envelope.header_int(HEADER_RETRY_COUNT), Some(1));
        assert!(retried.envelope.header_int(HEADER_FIRST_FAILURE_AT).is_some());
        assert_eq!(retried.envelope.header_str("tenant"), Some("acme"));
        assert_eq!(retried.envelope.correlation_id.as_deref(), Some("abc-1"));
        retried.ack().await.unwrap();

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_message_is_quarantined_and_never_republished() {
        let broker = InMemoryBroker::new();
        let sink = Arc::new(RecordingAlertSink::default());
        let handle = RetryScheduler::new(broker.clone(), fast_config(), routes())
            .with_alert_sink(sink.clone())
            .start()
            .await
            .unwrap();
        let mut requests = broker.consume("account.create").await.unwrap();
        let mut poison = broker.consume("poison").await.unwrap();

        broker
            .publish(
                "account.create",
                Envelope::new(b"{\"email\":\"a@b.c\"}".to_vec()).with_correlation_id("abc-1"),
            )
            .await
            .unwrap();

        let mut first_failure = None;
        for attempt in 0..4i64 {
            let delivery = timeout(WAIT, requests.next()).await.unwrap().unwrap();
            assert_eq!(delivery.envelope.header_int(HEADER_RETRY_COUNT).unwrap_or(0), attempt);
            if attempt > 0 {
                let at = delivery.envelope.header_int(HEADER_FIRST_FAILURE_AT);
                assert!(at.is_some());
                assert!(first_failure.is_none() || first_failure == at);
                first_failure = at;
            }
            delivery.reject(false).await.unwrap();
        }

        let quarantined = timeout(WAIT, poison.next()).await.unwrap().unwrap();
        assert_eq!(quarantined.envelope.header_str(HEADER_POISON_OPERATION), Some("account.create"));
        assert_eq!(quarantined.envelope.header_int(HEADER_RETRY_COUNT), Some(3));
        assert!(quarantined
            .envelope
            .header_str(HEADER_POISON_REASON)
            .unwrap()
            .contains("exhausted"));
        quarantined.ack().await.unwrap();

        assert!(timeout(Duration::from_millis(100), requests.next()).await.is_err());
        assert_eq!(broker.published_to("account.create"), 4);

        let alerts = sink.alerts.lock().clone();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].correlation_id, "abc-1");
        assert_eq!(alerts[0].retry_count, 3);
        assert_eq!(alerts[0].payload_preview, "{\"email\":\"a@b.c\"}");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn failed_republish_quarantines_immediately() {
        let broker = FailingTarget {
            inner: InMemoryBroker::new(),
            failing: "account.create".into(),
        };
        let handle = RetryScheduler::new(broker.clone(), fast_config(), routes())
            .start()
            .await
            .unwrap();
        let mut poison = broker.consume("poison").await.unwrap();

        broker
            .inner
            .publish("account.create.dlq", Envelope::new(vec![]).with_correlation_id("abc-2"))
            .await
            .unwrap();

        let quarantined = timeout(WAIT, poison.next()).await.unwrap().unwrap();
        assert_eq!(quarantined.envelope.correlation_id.as_deref(), Some("abc-2"));
        assert!(quarantined
            .envelope
            .header_str(HEADER_POISON_REASON)
            .unwrap()
            .starts_with("republish to account.create failed"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_poison_target_requeues_dead_letter() {
        let broker = FailingTarget {
            inner: InMemoryBroker::new(),
            failing: "poison".into(),
        };
        let handle = RetryScheduler::new(broker.clone(), fast_config(), routes())
            .start()
            .await
            .unwrap();

        broker
            .inner
            .publish(
                "account.create.dlq",
                Envelope::new(vec![]).with_header(HEADER_RETRY_COUNT, 3u32),
            )
            .await
            .unwrap();

        for _ in 0..200 {
            if broker.inner.stats().requeued > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        assert!(broker.inner.stats().requeued > 0);
        assert_eq!(broker.inner.published_to("account.create"), 0);
    }

    #[tokio::test]
    async fn backoff_does_not_block_other_dead_letters() {
        let broker = InMemoryBroker::new();
        let config = RetrySchedulerConfig {
            base_delay: Duration::from_secs(60),
            ..fast_config()
        };
        let handle = RetryScheduler::new(broker.clone(), config, routes())
            .start()
            .await
            .unwrap();
        let mut poison = broker.consume("poison").await.unwrap();

        // Waits a minute before its retry.
        broker
            .publish("account.create.dlq", Envelope::new(vec![]).with_correlation_id("slow"))
            .await
            .unwrap();
        // Exhausted, must be quarantined right away.
        broker
            .publish(
                "account.create.dlq",
                Envelope::new(vec![])
                    .with_correlation_id("done")
                    .with_header(HEADER_RETRY_COUNT, 3u32),
            )
            .await
            .unwrap();

        let quarantined = timeout(WAIT, poison.next()).await.unwrap().unwrap();
        assert_eq!(quarantined.envelope.correlation_id.as_deref(), Some("done"));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_consumption() {
        let broker = InMemoryBroker::new();
        let handle = RetryScheduler::new(broker.clone(), fast_config(), routes())
            .start()
            .await
            .unwrap();
        assert!(handle.is_running());
        handle.shutdown().await;

        broker
            .publish("account.create.dlq", Envelope::new(vec![]))
            .await
            .unwrap();
        assert_eq!(broker.backlog_len("account.create.dlq"), 1);
    }

    #[tokio::test]
    async fn start_rejects_invalid_routes() {
        let broker = InMemoryBroker::new();
        let result = RetryScheduler::new(broker, fast_config(), Vec::new()).start().await;
        assert!(result.is_err());
    }
}
