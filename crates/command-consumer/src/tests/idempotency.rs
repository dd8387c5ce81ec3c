//! Recorded outcomes short-circuit redeliveries.

use super::harness::{ScriptedHandler, Step, TestHarness, OPERATION};
use crate::ConsumeOutcome;
use idempotency_gate::{idempotency_key, IdempotencyStore};
use serde_json::json;
use std::time::Duration;
use sync_rpc_client::{ReplyBody, ReplyErrorKind};

#[tokio::test]
async fn redelivered_command_replays_result_without_executing() {
    let harness = TestHarness::new(ScriptedHandler::succeeding()).await;
    let command = harness.command("abc-1");

    assert_eq!(harness.deliver(command.clone()).await, ConsumeOutcome::Executed);
    assert_eq!(harness.deliver(command).await, ConsumeOutcome::CachedResult);

    assert_eq!(harness.handler.calls(), 1);
    let replies = harness.replies();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0], ReplyBody::ok(json!({"account_id": 42})));
    assert_eq!(replies[0], replies[1]);
    assert_eq!(harness.broker.stats().acked, 2);
}

#[tokio::test]
async fn permanent_failure_is_replayed_without_executing() {
    let harness =
        TestHarness::new(ScriptedHandler::always(Step::FailPermanently("email already registered".into()))).await;
    let command = harness.command("abc-2");

    assert_eq!(harness.deliver(command.clone()).await, ConsumeOutcome::PermanentFailure);
    assert_eq!(harness.deliver(command).await, ConsumeOutcome::CachedFailure);

    assert_eq!(harness.handler.calls(), 1);
    let expected = ReplyBody::error(ReplyErrorKind::PermanentFailure, "email already registered");
    assert_eq!(harness.replies(), vec![expected.clone(), expected]);
    assert_eq!(harness.dead_lettered(), 0);
}

#[tokio::test]
async fn distinct_correlation_ids_execute_separately() {
    let harness = TestHarness::new(ScriptedHandler::succeeding()).await;

    assert_eq!(harness.deliver(harness.command("abc-1")).await, ConsumeOutcome::Executed);
    assert_eq!(harness.deliver(harness.command("abc-2")).await, ConsumeOutcome::Executed);
    assert_eq!(harness.handler.calls(), 2);
}

#[tokio::test]
async fn concurrent_redeliveries_execute_at_most_once() {
    let handler = ScriptedHandler::succeeding().with_delay(Duration::from_millis(50));
    let harness = TestHarness::new(handler).await;

    let outcomes = harness.deliver_concurrently(harness.command("abc-1"), 8).await;

    assert_eq!(harness.handler.calls(), 1);
    let executed = outcomes.iter().filter(|o| **o == ConsumeOutcome::Executed).count();
    assert_eq!(executed, 1);
    assert!(outcomes.iter().all(|o| matches!(
        o,
        ConsumeOutcome::Executed
            | ConsumeOutcome::CachedResult
            | ConsumeOutcome::CachedFailure
            | ConsumeOutcome::ConcurrentDuplicate
    )));
}

#[tokio::test]
async fn non_json_result_is_recorded_as_permanent_failure() {
    let harness = TestHarness::new(ScriptedHandler::always(Step::ReturnRaw(b"<ok/>".to_vec()))).await;
    let command = harness.command("abc-3");

    assert_eq!(harness.deliver(command.clone()).await, ConsumeOutcome::PermanentFailure);
    assert_eq!(harness.deliver(command).await, ConsumeOutcome::CachedFailure);
    assert_eq!(harness.handler.calls(), 1);
}

#[tokio::test]
async fn success_is_recorded_under_operation_key() {
    let harness = TestHarness::new(ScriptedHandler::succeeding()).await;
    harness.deliver(harness.command("abc-1")).await;

    let key = idempotency_key(OPERATION, "abc-1");
    let stored = harness.store.get(&key).await.unwrap().unwrap();
    assert!(stored.contains("succeeded"));
}

#[tokio::test]
async fn command_without_reply_destination_is_acked() {
    let harness = TestHarness::new(ScriptedHandler::succeeding()).await;
    let mut command = harness.command("abc-4");
    command.reply_to = None;

    assert_eq!(harness.deliver(command).await, ConsumeOutcome::Executed);
    assert!(harness.replies().is_empty());
    assert_eq!(harness.broker.stats().acked, 1);
}
