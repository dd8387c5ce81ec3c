//! Integration tests for the command consumer.
//!
//! - `harness.rs`     - Scripted handler and in-memory wiring
//! - `idempotency.rs` - Replay of recorded results and failures, at most one execution
//! - `dead_letter.rs` - Claim rejection, transient failures and malformed commands
//! - `end_to_end.rs`  - RPC client, consumer, retry scheduler and poison monitor together

mod end_to_end;
mod idempotency;
