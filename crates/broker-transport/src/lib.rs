//! Broker transport for the relay layer.
//!
//! The relay treats the message broker as an external collaborator offering:
//!
//! - addressable publish targets
//! - string/integer message headers, a correlation id and a reply destination
//! - at-least-once delivery with explicit ack / reject
//! - dead-lettering of rejected messages to a configured alternate target
//!
//! [`Broker`] captures that contract. Two backends are provided:
//! [`InMemoryBroker`] for tests and single-process deployments, and
//! [`RedisBroker`] on top of Redis Streams consumer groups.

pub mod broker;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod redis_broker;

pub use broker::{
    Acknowledger, Broker, Delivery, DeliveryStream, ListenerTeardown, QueueOptions, ReplyHandler,
    ReplyListener,
};
pub use envelope::{Envelope, HeaderValue, Headers, HEADER_DEATH_REASON, HEADER_ORIGINAL_TARGET};
pub use error::{BrokerError, BrokerResult};
pub use memory::{BrokerStats, InMemoryBroker};
pub use redis_broker::{RedisBroker, RedisBrokerConfig};
