//! The gate a command consumer consults before running business logic.

use crate::error::{GateError, GateResult};
use crate::store::IdempotencyStore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Default retention of idempotency records.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Gate configuration.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// TTL applied to every record write.
    pub retention: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
        }
    }
}

/// State of one idempotency key. An absent key has no record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IdempotencyRecord {
    InFlight { claimed_at_ms: i64 },
    Succeeded { result: serde_json::Value },
    Failed { error: String },
}

/// Derive the idempotency key for one logical request.
pub fn idempotency_key(operation: &str, correlation_id: &str) -> String {
    format!("{operation}:{correlation_id}")
}

/// Pure key-state contract over an [`IdempotencyStore`]. Knows nothing about
/// message transport.
pub struct IdempotencyGate<S> {
    store: S,
    config: GateConfig,
}

impl<S: IdempotencyStore> IdempotencyGate<S> {
    pub fn new(store: S, config: GateConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current record for `key`, if any.
    pub async fn lookup(&self, key: &str) -> GateResult<Option<IdempotencyRecord>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| GateError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    /// Cached failure message, if the single execution for `key` failed permanently.
    pub async fn check_failure(&self, key: &str) -> GateResult<Option<String>> {
        match self.lookup(key).await? {
            Some(IdempotencyRecord::Failed { error }) => Ok(Some(error)),
            _ => Ok(None),
        }
    }

    /// Cached result, if the single execution for `key` succeeded.
    pub async fn check_cached(&self, key: &str) -> GateResult<Option<serde_json::Value>> {
        match self.lookup(key).await? {
            Some(IdempotencyRecord::Succeeded { result }) => Ok(Some(result)),
            _ => Ok(None),
        }
    }

    /// Atomically move `key` from absent to in-flight. Exactly one claimant
    /// gets `true`; everyone else must not execute business logic.
    pub async fn claim_first(&self, key: &str) -> GateResult<bool> {
        let record = IdempotencyRecord::InFlight {
            claimed_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        let claimed = self
            .store
            .set_if_absent(key, &encode(key, &record)?, self.config.retention)
            .await?;
        debug!(key = %key, claimed, "Idempotency claim attempted");
        Ok(claimed)
    }

    pub async fn record_success(&self, key: &str, result: &serde_json::Value) -> GateResult<()> {
        let record = IdempotencyRecord::Succeeded {
            result: result.clone(),
        };
        self.store
            .set(key, &encode(key, &record)?, self.config.retention)
            .await
    }

    pub async fn record_failure(&self, key: &str, error: &str) -> GateResult<()> {
        let record = IdempotencyRecord::Failed {
            error: error.to_string(),
        };
        self.store
            .set(key, &encode(key, &record)?, self.config.retention)
            .await
    }

    /// Drop an in-flight claim after a transient failure so a later
    /// redelivery can claim and execute again. Terminal records are kept.
    pub async fn release(&self, key: &str) -> GateResult<()> {
        match self.lookup(key).await {
            Ok(Some(IdempotencyRecord::InFlight { .. })) | Err(GateError::Corrupt { .. }) => {
                self.store.delete(key).await
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn encode(key: &str, record: &IdempotencyRecord) -> GateResult<String> {
    serde_json::to_string(record).map_err(|e| GateError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
