//! Reply body exchanged between command consumers and RPC callers.
//!
//! Wire format (JSON):
//!
//! ```text
//! {"status":"ok","result":<any JSON>}
//! {"status":"error","kind":"permanent_failure"|"rejected"|"internal","message":"..."}
//! ```

use crate::error::{RpcError, RpcResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Why a responder answered with an error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyErrorKind {
    /// The operation failed permanently; redeliveries replay this failure.
    PermanentFailure,
    /// The request was refused before any business logic ran.
    Rejected,
    /// Responder-side fault unrelated to the request.
    Internal,
}

/// Body of a reply envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyBody {
    Ok {
        result: serde_json::Value,
    },
    Error {
        kind: ReplyErrorKind,
        message: String,
    },
}

impl ReplyBody {
    pub fn ok(result: serde_json::Value) -> Self {
        ReplyBody::Ok { result }
    }

    pub fn error(kind: ReplyErrorKind, message: impl Into<String>) -> Self {
        ReplyBody::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode reply bytes; anything that is not a reply body is a
    /// serialization failure.
    pub fn decode(bytes: &[u8]) -> RpcResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| RpcError::Serialization(format!("reply is not a reply body: {e}")))
    }

    /// Convert into the caller's expected type.
    ///
    /// Error bodies never leak a naked decode error: a replayed permanent
    /// failure maps to [`RpcError::PermanentFailure`], every other error
    /// body to [`RpcError::InvalidResponse`].
    pub fn into_typed<T: DeserializeOwned>(self) -> RpcResult<T> {
        match self {
            ReplyBody::Ok { result } => serde_json::from_value(result)
                .map_err(|e| RpcError::InvalidResponse(format!("unexpected result shape: {e}"))),
            ReplyBody::Error {
                kind: ReplyErrorKind::PermanentFailure,
                message,
            } => Err(RpcError::PermanentFailure(message)),
            ReplyBody::Error { kind, message } => Err(RpcError::InvalidResponse(format!(
                "responder returned {kind:?}: {message}"
            ))),
        }
    }
}
