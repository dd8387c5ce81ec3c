//! Passive monitor of the poison target.
//!
//! Records every quarantined message for inspection and acknowledges it.
//! It never republishes anything.

use crate::error::SchedulerResult;
use crate::handle::{stopped, SchedulerHandle};
use crate::policy::{
    HEADER_FIRST_FAILURE_AT, HEADER_POISONED_AT, HEADER_POISON_ALERT, HEADER_POISON_OPERATION,
    HEADER_POISON_REASON, HEADER_RETRY_COUNT,
};
use broker_transport::{Broker, DeliveryStream, Envelope, Headers};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default number of entries kept by a [`PoisonLedger`].
pub const DEFAULT_LEDGER_CAPACITY: usize = 1024;

/// A terminally failed message as seen on the poison target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoisonEntry {
    pub operation: String,
    pub correlation_id: Option<String>,
    pub poisoned_at: Option<DateTime<Utc>>,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub retry_count: Option<i64>,
    pub reason: Option<String>,
    pub alert: Option<String>,
    /// Complete header set, for postmortems.
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl PoisonEntry {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            operation: envelope
                .header_str(HEADER_POISON_OPERATION)
                .unwrap_or("unknown")
                .to_string(),
            correlation_id: envelope.correlation_id.clone(),
            poisoned_at: envelope
                .header_str(HEADER_POISONED_AT)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            first_failure_at: envelope
                .header_int(HEADER_FIRST_FAILURE_AT)
                .and_then(DateTime::from_timestamp_millis),
            retry_count: envelope.header_int(HEADER_RETRY_COUNT),
            reason: envelope.header_str(HEADER_POISON_REASON).map(str::to_string),
            alert: envelope.header_str(HEADER_POISON_ALERT).map(str::to_string),
            headers: envelope.headers.clone(),
            payload: envelope.payload.clone(),
        }
    }
}

/// Bounded in-memory record of poison entries; the oldest entry is evicted
/// first.
#[derive(Debug)]
pub struct PoisonLedger {
    capacity: usize,
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    entries: VecDeque<PoisonEntry>,
    total: u64,
}

impl Default for PoisonLedger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
    }
}

impl PoisonLedger {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn record(&self, entry: PoisonEntry) {
        let mut state = self.state.lock();
        if state.entries.len() == self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(entry);
        state.total += 1;
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> Vec<PoisonEntry> {
        self.state.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries ever recorded, evicted ones included.
    pub fn total_recorded(&self) -> u64 {
        self.state.lock().total
    }
}

/// Consumes the poison target into a [`PoisonLedger`].
pub struct PoisonMonitor<B> {
    broker: B,
    poison_target: String,
    ledger: Arc<PoisonLedger>,
}

impl<B: Broker> PoisonMonitor<B> {
    pub fn new(broker: B, poison_target: impl Into<String>, ledger: Arc<PoisonLedger>) -> Self {
        Self {
            broker,
            poison_target: poison_target.into(),
            ledger,
        }
    }

    pub fn ledger(&self) -> Arc<PoisonLedger> {
        self.ledger.clone()
    }

    pub async fn start(self) -> SchedulerResult<SchedulerHandle> {
        let stream = self.broker.consume(&self.poison_target).await?;
        info!(poison_target = %self.poison_target, "Poison monitor started");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(watch_poison(self.ledger, self.poison_target, stream, shutdown_rx));
        Ok(SchedulerHandle::new(shutdown_tx, vec![task]))
    }
}

async fn watch_poison(
    ledger: Arc<PoisonLedger>,
    poison_target: String,
    mut stream: DeliveryStream,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            next = stream.next() => {
                let Some(delivery) = next else {
                    warn!(poison_target = %poison_target, "Poison stream closed");
                    break;
                };

                let entry = PoisonEntry::from_envelope(&delivery.envelope);
                info!(
                    correlation_id = %delivery.envelope.correlation_label(),
                    operation = %entry.operation,
                    state = "quarantined",
                    retry_count = entry.retry_count.unwrap_or_default(),
                    reason = entry.reason.as_deref().unwrap_or("-"),
                    "Poison message observed"
                );
                ledger.record(entry);

                if let Err(e) = delivery.ack().await {
                    warn!(poison_target = %poison_target, error = %e, "Failed to ack poison message");
                }
            }
        }
    }
    debug!(poison_target = %poison_target, "Poison monitor exited");
}
