//! Request/response envelopes exchanged inside frames
//!
//! One request envelope identifies exactly one in-flight call; the response
//! echoes its `request_id` back so the client can correlate completions that
//! arrive in any order. Envelopes are serialized with bincode into a frame
//! payload; both peers must agree on this encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Status of a completed call, carried on the wire
///
/// Local cancellation never travels as a status; a canceled call surfaces as
/// a client-side error and any late response for it is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcStatus {
    /// Handler completed successfully
    Ok,
    /// No handler registered for the requested (service, method)
    NotFound,
    /// Handler failed; details in the error message
    Exception,
}

/// A single outbound call: who to invoke and with what argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation id, unique among the sender's outstanding calls
    pub request_id: u32,
    /// Target service
    pub service_id: i32,
    /// Target method within the service
    pub method_id: i32,
    /// Serialized call argument; empty for argument-less calls
    pub payload: Bytes,
}

/// The reply to one request, correlated by `request_id`
///
/// The server never originates a `request_id`; it only echoes the id it
/// received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Echo of the request's correlation id
    pub request_id: u32,
    /// Call outcome
    pub status: RpcStatus,
    /// Serialized result; empty unless `status` is `Ok`
    pub payload: Bytes,
    /// Failure description for non-`Ok` statuses
    pub error_message: Option<String>,
}

impl RequestEnvelope {
    /// Serialize into a frame payload
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Deserialize from a frame payload
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl ResponseEnvelope {
    /// Build a successful response carrying a serialized result
    pub fn ok(request_id: u32, payload: Bytes) -> Self {
        Self {
            request_id,
            status: RpcStatus::Ok,
            payload,
            error_message: None,
        }
    }

    /// Build a response for a request that matched no registered handler
    pub fn not_found(request_id: u32, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: RpcStatus::NotFound,
            payload: Bytes::new(),
            error_message: Some(message.into()),
        }
    }

    /// Build a response for a handler that failed
    pub fn exception(request_id: u32, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: RpcStatus::Exception,
            payload: Bytes::new(),
            error_message: Some(message.into()),
        }
    }

    /// Serialize into a frame payload
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Deserialize from a frame payload
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
