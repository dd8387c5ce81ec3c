//! Key-value store contract behind the gate, and its in-memory backend.

use crate::error::GateResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimal store the gate needs. `set_if_absent` must be an atomic
/// test-and-set: it is the only cross-instance synchronisation point.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> GateResult<Option<String>>;

    /// Store `value` only if `key` is absent. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> GateResult<bool>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> GateResult<()>;

    async fn delete(&self, key: &str) -> GateResult<()>;
}

#[async_trait]
impl<S: IdempotencyStore + ?Sized> IdempotencyStore for Arc<S> {
    async fn get(&self, key: &str) -> GateResult<Option<String>> {
        (**self).get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> GateResult<bool> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> GateResult<()> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> GateResult<()> {
        (**self).delete(key).await
    }
}

/// Writes between two full sweeps of expired entries.
const SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: &str, ttl: Duration, now: Instant) -> Self {
        Self {
            value: value.to_string(),
            // `None` when the TTL is too large to represent: never expires.
            expires_at: now.checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
    writes: u64,
}

impl Entries {
    /// Drop `key` if it has expired.
    fn evict_if_expired(&mut self, key: &str, now: Instant) {
        if self.map.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.map.remove(key);
        }
    }

    fn insert(&mut self, key: &str, entry: Entry, now: Instant) {
        self.map.insert(key.to_string(), entry);
        self.writes += 1;
        if self.writes % SWEEP_INTERVAL == 0 {
            self.sweep(now);
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.is_live(now));
        before - self.map.len()
    }
}

/// Process-local store. Expired entries are evicted when their key is
/// touched, and swept in full every [`SWEEP_INTERVAL`] writes.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<Entries>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.entries.lock().sweep(Instant::now())
    }

    /// Entries held, expired ones not yet evicted included.
    fn stored(&self) -> usize {
        self.entries.lock().map.len()
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<String> {
        let mut entries = self.entries.lock();
        entries.evict_if_expired(key, now);
        entries.map.get(key).map(|entry| entry.value.clone())
    }

    fn set_if_absent_at(&self, key: &str, value: &str, ttl: Duration, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        entries.evict_if_expired(key, now);
        if entries.map.contains_key(key) {
            return false;
        }
        entries.insert(key, Entry::new(value, ttl, now), now);
        true
    }

    fn set_at(&self, key: &str, value: &str, ttl: Duration, now: Instant) {
        self.entries.lock().insert(key, Entry::new(value, ttl, now), now);
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> GateResult<Option<String>> {
        Ok(self.get_at(key, Instant::now()))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> GateResult<bool> {
        Ok(self.set_if_absent_at(key, value, ttl, Instant::now()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> GateResult<()> {
        self.set_at(key, value, ttl, Instant::now());
        Ok(())
    }

    async fn delete(&self, key: &str) -> GateResult<()> {
        self.entries.lock().map.remove(key);
        Ok(())
    }
}
