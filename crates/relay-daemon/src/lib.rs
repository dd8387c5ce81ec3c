//! Relay daemon.
//!
//! Wires the relay crates to Redis for the `relay` binary:
//!
//! - `relay scheduler` runs the dead-letter retry scheduler and the poison
//!   monitor for every configured operation
//! - `relay call` performs one RPC call and prints the reply body
//! - `relay inspect` prints the idempotency record of one command

pub mod config;
pub mod error;

pub use config::{dead_letter_override_var, parse_routes, RelayConfig};
pub use error::{RelayError, RelayResult};
