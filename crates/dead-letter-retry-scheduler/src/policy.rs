//! Retry-or-quarantine decision for one dead-lettered envelope.
//!
//! Pure: no broker, no clock of its own. The scheduler passes `now` in.

use crate::config::{OperationRoute, RetrySchedulerConfig};
use broker_transport::{Envelope, HEADER_ORIGINAL_TARGET};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Retries already attempted for this logical message. Absent means 0.
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";

/// Milliseconds since the epoch of the first dead-lettering. Set once.
pub const HEADER_FIRST_FAILURE_AT: &str = "x-first-failure-at";

/// Operation a quarantined message belonged to.
pub const HEADER_POISON_OPERATION: &str = "x-poison-operation";

/// RFC 3339 time of quarantine.
pub const HEADER_POISONED_AT: &str = "x-poisoned-at";

/// Why the message was quarantined.
pub const HEADER_POISON_REASON: &str = "x-poison-reason";

/// Human-readable alert text.
pub const HEADER_POISON_ALERT: &str = "x-poison-alert";

/// What to do with a dead-lettered envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish `next` to the original target once `delay` has elapsed.
    Retry { delay: Duration, next: Envelope },
    /// Move the envelope to the poison target now.
    Quarantine { reason: String },
}

/// `base * 2^retry_count`, saturating instead of overflowing.
pub fn backoff_delay(base: Duration, retry_count: u32) -> Duration {
    let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// Target the message originally failed on.
pub fn original_target<'a>(route: &'a OperationRoute, envelope: &'a Envelope) -> &'a str {
    envelope
        .header_str(HEADER_ORIGINAL_TARGET)
        .unwrap_or(route.request_target.as_str())
}

/// Retry count carried by `envelope`; `Err` when the header is unreadable.
pub fn retry_count(envelope: &Envelope) -> Result<u32, String> {
    match envelope.header(HEADER_RETRY_COUNT) {
        None => Ok(0),
        Some(value) => value
            .as_int()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| format!("unreadable {HEADER_RETRY_COUNT} header: {value}")),
    }
}

/// Decide retry vs quarantine.
///
/// A retry copies the envelope under a new message id with the retry count
/// incremented by exactly one and the first-failure time set only if it was
/// absent; every other header is carried through as is.
pub fn decide(
    route: &OperationRoute,
    envelope: &Envelope,
    config: &RetrySchedulerConfig,
    now: DateTime<Utc>,
) -> RetryDecision {
    let count = match retry_count(envelope) {
        Ok(count) => count,
        Err(reason) => return RetryDecision::Quarantine { reason },
    };

    if count >= config.max_retries {
        return RetryDecision::Quarantine {
            reason: format!(
                "retry budget exhausted after {count} of {} retries",
                config.max_retries
            ),
        };
    }

    let mut next = envelope.republished();
    next.set_header(HEADER_RETRY_COUNT, count + 1);
    next.set_header_if_absent(HEADER_FIRST_FAILURE_AT, now.timestamp_millis());
    next.set_header_if_absent(HEADER_ORIGINAL_TARGET, route.request_target.as_str());

    RetryDecision::Retry {
        delay: backoff_delay(config.base_delay, count),
        next,
    }
}

/// Copy of `envelope` bound for the poison target, stamped with the
/// quarantine metadata. The original header set is kept in full.
pub fn poisoned(
    route: &OperationRoute,
    envelope: &Envelope,
    reason: &str,
    alert_text: &str,
    now: DateTime<Utc>,
) -> Envelope {
    let mut poisoned = envelope.republished();
    poisoned.set_header(HEADER_POISON_OPERATION, route.operation.as_str());
    poisoned.set_header(HEADER_POISONED_AT, now.to_rfc3339());
    poisoned.set_header(HEADER_POISON_REASON, reason);
    poisoned.set_header(HEADER_POISON_ALERT, alert_text);
    poisoned.set_header_if_absent(HEADER_ORIGINAL_TARGET, route.request_target.as_str());
    poisoned
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn route() -> OperationRoute {
        OperationRoute::new("account.create")
    }

    fn config() -> RetrySchedulerConfig {
        RetrySchedulerConfig::default()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn backoff_doubles_from_base() {
        let base = Duration::from_secs(5);
        let delays: Vec<u64> = (0..4).map(|n| backoff_delay(base, n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40]);
    }

    #[test]
    fn backoff_strictly_increases_below_budget() {
        let config = RetrySchedulerConfig {
            max_retries: 10,
            ..config()
        };
        for n in 1..config.max_retries {
            assert!(backoff_delay(config.base_delay, n) > backoff_delay(config.base_delay, n - 1));
            assert_eq!(
                backoff_delay(config.base_delay, n),
                config.base_delay * 2u32.pow(n)
            );
        }
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(backoff_delay(Duration::from_secs(5), 40), Duration::from_secs(5).saturating_mul(u32::MAX));
        assert_eq!(backoff_delay(Duration::MAX, 3), Duration::MAX);
    }

    #[test]
    fn first_dead_letter_retries_with_count_one() {
        let envelope = Envelope::new(b"{}".to_vec()).with_correlation_id("abc-1");

        match decide(&route(), &envelope, &config(), now()) {
            RetryDecision::Retry { delay, next } => {
                assert_eq!(delay, Duration::from_secs(5));
                assert_eq!(next.header_int(HEADER_RETRY_COUNT), Some(1));
                assert_eq!(next.header_int(HEADER_FIRST_FAILURE_AT), Some(now().timestamp_millis()));
                assert_eq!(next.header_str(HEADER_ORIGINAL_TARGET), Some("account.create"));
                assert_eq!(next.correlation_id.as_deref(), Some("abc-1"));
                assert_ne!(next.message_id, envelope.message_id);
            }
            other => panic!("expected retry, got {other:?}"),
        }
        // The received envelope is left untouched.
        assert!(envelope.header(HEADER_RETRY_COUNT).is_none());
    }

    #[test]
    fn later_retry_keeps_first_failure_and_caller_headers() {
        let envelope = Envelope::new(b"{}".to_vec())
            .with_header(HEADER_RETRY_COUNT, 2u32)
            .with_header(HEADER_FIRST_FAILURE_AT, 1_000i64)
            .with_header("tenant", "acme")
            .with_header("x-death-reason", "rejected");

        let RetryDecision::Retry { delay, next } = decide(&route(), &envelope, &config(), now()) else {
            panic!("expected retry");
        };
        assert_eq!(delay, Duration::from_secs(20));
        assert_eq!(next.header_int(HEADER_RETRY_COUNT), Some(3));
        assert_eq!(next.header_int(HEADER_FIRST_FAILURE_AT), Some(1_000));
        assert_eq!(next.header_str("tenant"), Some("acme"));
        assert_eq!(next.header_str("x-death-reason"), Some("rejected"));
    }

    #[test]
    fn exhausted_budget_quarantines() {
        for count in [3u32, 4, 100] {
            let envelope = Envelope::new(vec![]).with_header(HEADER_RETRY_COUNT, count);
            assert!(matches!(
                decide(&route(), &envelope, &config(), now()),
                RetryDecision::Quarantine { .. }
            ));
        }
    }

    #[test]
    fn unreadable_retry_count_quarantines() {
        for bad in ["three", "-1"] {
            let envelope = Envelope::new(vec![]).with_header(HEADER_RETRY_COUNT, bad);
            match decide(&route(), &envelope, &config(), now()) {
                RetryDecision::Quarantine { reason } => assert!(reason.contains(HEADER_RETRY_COUNT)),
                other => panic!("expected quarantine, got {other:?}"),
            }
        }
    }

    #[test]
    fn original_target_header_wins_over_route() {
        let envelope = Envelope::new(vec![]).with_header(HEADER_ORIGINAL_TARGET, "account.create.v2");
        assert_eq!(original_target(&route(), &envelope), "account.create.v2");
        assert_eq!(original_target(&route(), &Envelope::new(vec![])), "account.create");
    }

    #[test]
    fn poisoned_copy_keeps_headers_and_adds_metadata() {
        let envelope = Envelope::new(b"payload".to_vec())
            .with_correlation_id("abc-1")
            .with_header(HEADER_RETRY_COUNT, 3u32)
            .with_header("tenant", "acme");

        let poisoned = poisoned(&route(), &envelope, "retry budget exhausted", "alert", now());
        assert_eq!(poisoned.header_str(HEADER_POISON_OPERATION), Some("account.create"));
        assert_eq!(poisoned.header_str(HEADER_POISONED_AT), Some(now().to_rfc3339().as_str()));
        assert_eq!(poisoned.header_str(HEADER_POISON_REASON), Some("retry budget exhausted"));
        assert_eq!(poisoned.header_str(HEADER_POISON_ALERT), Some("alert"));
        assert_eq!(poisoned.header_int(HEADER_RETRY_COUNT), Some(3));
        assert_eq!(poisoned.header_str("tenant"), Some("acme"));
        assert_eq!(poisoned.payload, envelope.payload);
    }
}
