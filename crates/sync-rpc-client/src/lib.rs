//! Synchronous-over-asynchronous RPC client.
//!
//! A call publishes a request carrying a fresh correlation id and a
//! temporary reply destination, then suspends the calling task on a
//! one-shot slot until the matching reply arrives or the timeout elapses.
//!
//! ```text
//! caller ──call()──► open reply listener ──► publish request ──► wait (timeout)
//!   ▲                                                              │
//!   └───────────── typed result / RpcError ◄── close listener ◄────┘
//! ```
//!
//! The reply listener is torn down on every exit path; teardown failures are
//! logged and never reach the caller.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;

pub use client::RpcClient;
pub use config::RpcClientConfig;
pub use error::{RpcError, RpcResult};
pub use protocol::{ReplyBody, ReplyErrorKind};
