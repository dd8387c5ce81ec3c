//! The message envelope carried by every broker backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Header written by the broker when it dead-letters a message: the target
/// the message was originally published to. Never overwritten once set.
pub const HEADER_ORIGINAL_TARGET: &str = "x-original-target";

/// Header written by the broker when it dead-letters a message.
pub const HEADER_DEATH_REASON: &str = "x-death-reason";

/// A header value. Brokers carry string and integer headers only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(s) => Some(s),
            HeaderValue::Int(_) => None,
        }
    }

    /// Integer value. String headers holding a decimal number are accepted,
    /// since some brokers stringify everything.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(i) => Some(*i),
            HeaderValue::Str(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Int(i) => write!(f, "{i}"),
            HeaderValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

/// Ordered header map.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A message as seen by publishers and consumers.
///
/// The relay never mutates an envelope it received; retries and replies are
/// built as modified copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Broker-level message identifier, unique per publish.
    pub message_id: String,
    /// Links a request to its reply. Caller-generated.
    pub correlation_id: Option<String>,
    /// Destination the responder must publish the reply to.
    pub reply_to: Option<String>,
    /// String/integer key-value headers.
    pub headers: Headers,
    /// Serialized body, opaque to the transport.
    pub payload: Vec<u8>,
    /// Set by the broker when the message is delivered again after a requeue.
    pub redelivered: bool,
}

impl Envelope {
    /// Create an envelope with a fresh message id.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            reply_to: None,
            headers: Headers::new(),
            payload: payload.into(),
            redelivered: false,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Copy of this envelope under a new message id, as a republish would
    /// produce it. Correlation id, reply destination, headers and payload
    /// are preserved.
    pub fn republished(&self) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            redelivered: false,
            ..self.clone()
        }
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    pub fn header_int(&self, key: &str) -> Option<i64> {
        self.headers.get(key).and_then(HeaderValue::as_int)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Set a header only when it is not present yet.
    pub fn set_header_if_absent(&mut self, key: &str, value: impl Into<HeaderValue>) {
        if !self.headers.contains_key(key) {
            self.headers.insert(key.to_string(), value.into());
        }
    }

    /// Correlation id for log lines, `"-"` when absent.
    pub fn correlation_label(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or("-")
    }
}
