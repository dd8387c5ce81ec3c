//! Idempotency gate.
//!
//! Deduplicates redeliveries of the same logical command. Each command is
//! keyed by `operation:correlation_id`; a key moves through
//!
//! ```text
//! absent ──claim_first──► in-flight ──record_success──► succeeded
//!                             │
//!                             └──────record_failure──► failed
//! ```
//!
//! and only the claimant that performed the absent → in-flight transition
//! may execute business logic. The backing store only has to provide an
//! atomic set-if-absent; every other component stays lock-free.

pub mod error;
pub mod gate;
pub mod redis_store;
pub mod store;

pub use error::{GateError, GateResult};
pub use gate::{idempotency_key, GateConfig, IdempotencyGate, IdempotencyRecord, DEFAULT_RETENTION};
pub use redis_store::RedisIdempotencyStore;
pub use store::{IdempotencyStore, InMemoryIdempotencyStore};
