//! Command consumer.
//!
//! The point where the relay's mechanisms compose. A [`CommandConsumer`]
//! receives commands from a broker target, consults the idempotency gate,
//! runs the [`CommandHandler`] at most once per `operation:correlation_id`,
//! records the outcome, and replies to the caller's reply destination.
//!
//! ```text
//! request ──► check_failure ──hit──► reply cached error, ack
//!                  │
//!             check_cached ──hit──► reply cached result, ack
//!                  │
//!             claim_first ──lost──► reject (dead-letter)
//!                  │
//!               handler ──ok────────► record_success, reply, ack
//!                  ├────permanent───► record_failure, reply, ack
//!                  └────transient───► release claim, reject (dead-letter)
//! ```

pub mod consumer;
pub mod error;
pub mod handler;

#[cfg(test)]
mod tests;

pub use consumer::{CommandConsumer, ConsumeOutcome};
pub use error::{ConsumerError, ConsumerResult};
pub use handler::{CommandHandler, HandlerError};
