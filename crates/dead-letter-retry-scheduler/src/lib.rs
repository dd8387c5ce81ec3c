//! Dead-letter retry scheduler.
//!
//! Consumes every operation's dead-letter target and, per message, either
//! republishes it to its original target after `base_delay * 2^retry_count`
//! or, once `max_retries` is reached, moves it to the poison target with
//! diagnostic headers and raises an alert.
//!
//! ```text
//! <op>.dlq ──► RetryScheduler ──(sleep, x-retry-count + 1)──► <op>
//!                    │
//!                    └──(budget exhausted / republish failed)──► poison ──► PoisonMonitor
//! ```
//!
//! The retry decision itself is the pure [`decide`] function; the
//! scheduler only wires it to the broker.

pub mod alert;
pub mod config;
pub mod error;
pub mod handle;
pub mod poison;
pub mod policy;
pub mod scheduler;

pub use alert::{payload_preview, AlertSink, LogAlertSink, PoisonAlert};
pub use config::{OperationRoute, RetrySchedulerConfig, DEAD_LETTER_SUFFIX};
pub use error::{SchedulerError, SchedulerResult};
pub use handle::SchedulerHandle;
pub use poison::{PoisonEntry, PoisonLedger, PoisonMonitor, DEFAULT_LEDGER_CAPACITY};
pub use policy::{
    backoff_delay, decide, original_target, RetryDecision, HEADER_FIRST_FAILURE_AT,
    HEADER_POISONED_AT, HEADER_POISON_ALERT, HEADER_POISON_OPERATION, HEADER_POISON_REASON,
    HEADER_RETRY_COUNT,
};
pub use scheduler::RetryScheduler;
