//! The full relay path on the in-memory broker:
//! RPC client -> consumer -> dead letter -> retry scheduler -> consumer | poison.

use super::harness::{eventually, ScriptedHandler, Step, TestHarness, OPERATION};
use broker_transport::{Broker, InMemoryBroker};
use dead_letter_retry_scheduler::{
    OperationRoute, PoisonLedger, PoisonMonitor, RetryScheduler, RetrySchedulerConfig, SchedulerHandle,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use sync_rpc_client::{RpcClient, RpcClientConfig, RpcError};

#[derive(Debug, Deserialize, PartialEq)]
struct Created {
    account_id: u64,
}

fn rpc_client(harness: &TestHarness) -> RpcClient<InMemoryBroker> {
    RpcClient::new(
        harness.broker.clone(),
        RpcClientConfig::with_reply_timeout(Duration::from_secs(2)),
    )
}

async fn start_scheduler(harness: &TestHarness) -> SchedulerHandle {
    let config = RetrySchedulerConfig {
        base_delay: Duration::from_millis(5),
        max_retries: 3,
        ..Default::default()
    };
    RetryScheduler::new(harness.broker.clone(), config, vec![OperationRoute::new(OPERATION)])
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn rpc_call_is_answered_by_consumer() {
    let harness = TestHarness::new(ScriptedHandler::succeeding()).await;
    let consumer = harness.start_consumer();

    let created: Created = rpc_client(&harness)
        .call(OPERATION, &json!({"email": "ada@example.com"}))
        .await
        .unwrap();

    assert_eq!(created, Created { account_id: 42 });
    assert_eq!(harness.handler.calls(), 1);
    assert_eq!(harness.broker.stats().live_reply_listeners, 1);
    consumer.abort();
}

#[tokio::test]
async fn permanent_failure_reaches_rpc_caller() {
    let harness =
        TestHarness::new(ScriptedHandler::always(Step::FailPermanently("email already registered".into()))).await;
    let consumer = harness.start_consumer();

    let result: Result<Created, RpcError> = rpc_client(&harness)
        .call(OPERATION, &json!({"email": "ada@example.com"}))
        .await;

    match result {
        Err(RpcError::PermanentFailure(message)) => assert_eq!(message, "email already registered"),
        other => panic!("expected permanent failure, got {other:?}"),
    }
    consumer.abort();
}

#[tokio::test]
async fn transient_failure_is_retried_until_the_caller_gets_a_reply() {
    let handler = ScriptedHandler::scripted(
        vec![Step::FailTransiently("database unavailable".into())],
        Step::Succeed(json!({"account_id": 9})),
    );
    let harness = TestHarness::new(handler).await;
    let scheduler = start_scheduler(&harness).await;
    let consumer = harness.start_consumer();

    let created: Created = rpc_client(&harness)
        .call(OPERATION, &json!({"email": "ada@example.com"}))
        .await
        .unwrap();

    assert_eq!(created, Created { account_id: 9 });
    assert_eq!(harness.handler.calls(), 2);
    scheduler.shutdown().await;
    consumer.abort();
}

#[tokio::test]
async fn exhausted_retries_end_in_poison_and_stop() {
    let harness = TestHarness::new(ScriptedHandler::always(Step::FailTransiently("still down".into()))).await;
    let scheduler = start_scheduler(&harness).await;
    let ledger = Arc::new(PoisonLedger::default());
    let monitor = PoisonMonitor::new(harness.broker.clone(), "poison", ledger.clone())
        .start()
        .await
        .unwrap();
    let consumer = harness.start_consumer();

    let mut command = harness.command("abc-9");
    command.reply_to = None;
    harness.broker.publish(OPERATION, command).await.unwrap();

    eventually(|| ledger.len() == 1).await;
    let entries = ledger.entries();
    let entry = &entries[0];
    assert_eq!(entry.operation, OPERATION);
    assert_eq!(entry.correlation_id.as_deref(), Some("abc-9"));
    assert_eq!(entry.retry_count, Some(3));
    assert!(entry.first_failure_at.is_some());

    // One first attempt plus three retries, then nothing more.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.handler.calls(), 4);
    assert_eq!(harness.broker.published_to(OPERATION), 4);
    assert_eq!(ledger.total_recorded(), 1);

    consumer.abort();
    monitor.shutdown().await;
    scheduler.shutdown().await;
}
