//! Wire encoding/decoding for the CDP JSON protocol (§4.1).
//!
//! The codec is stateless apart from a monotonic id counter: it never holds
//! on to in-flight requests, that bookkeeping belongs to the [`crate::connection::Connection`]
//! and the [`crate::manager::Manager`].

use std::borrow::Cow;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::types::{CallId, SessionId};

/// A command ready to be written to the wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutgoingCommand {
    pub id: CallId,
    pub method: Cow<'static, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "is_empty_params")]
    pub params: Value,
}

fn is_empty_params(v: &Value) -> bool {
    matches!(v, Value::Null) || matches!(v, Value::Object(m) if m.is_empty())
}

/// An incoming CDP error payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CdpErrorPayload {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

/// The three-way classification of an incoming frame, plus an `Unknown`
/// fallback so malformed input never crashes the connection (§4.1).
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response {
        id: CallId,
        result: Value,
    },
    ErrorResponse {
        id: CallId,
        error: CdpErrorPayload,
    },
    Event {
        method: Cow<'static, str>,
        params: Value,
        session_id: Option<SessionId>,
    },
    Unknown(Bytes),
}

/// Assigns monotone, never-reused command identifiers for one connection.
#[derive(Debug, Default)]
pub struct Codec {
    next_id: u64,
}

impl Codec {
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    fn next_call_id(&mut self) -> CallId {
        let id = CallId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Encodes a command, assigning it a fresh identifier.
    pub fn encode(
        &mut self,
        method: impl Into<Cow<'static, str>>,
        params: Value,
        session: Option<&SessionId>,
    ) -> (CallId, String) {
        let id = self.next_call_id();
        let cmd = OutgoingCommand {
            id,
            method: method.into(),
            session_id: session.map(|s| s.0.clone()),
            params,
        };
        // Serialization of our own, well-formed struct cannot fail.
        let text = serde_json::to_string(&cmd).expect("OutgoingCommand always serializes");
        (id, text)
    }

    /// Decodes one incoming wire frame. Never errors: anything that does not
    /// match the known shapes is folded into [`Frame::Unknown`].
    pub fn decode(bytes: &[u8]) -> Frame {
        let value: Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(_) => return Frame::Unknown(Bytes::copy_from_slice(bytes)),
        };
        Self::decode_value(value, bytes)
    }

    fn decode_value(value: Value, raw: &[u8]) -> Frame {
        let obj = match value.as_object() {
            Some(o) => o,
            None => return Frame::Unknown(Bytes::copy_from_slice(raw)),
        };

        if let Some(id) = obj.get("id").and_then(Value::as_u64) {
            if let Some(err) = obj.get("error") {
                let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown CDP error")
                    .to_string();
                let data = err.get("data").cloned();
                return Frame::ErrorResponse {
                    id: CallId(id),
                    error: CdpErrorPayload {
                        code,
                        message,
                        data,
                    },
                };
            }
            let result = obj.get("result").cloned().unwrap_or(Value::Object(Default::default()));
            return Frame::Response { id: CallId(id), result };
        }

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            let params = obj.get("params").cloned().unwrap_or(Value::Object(Default::default()));
            let session_id = obj
                .get("sessionId")
                .and_then(Value::as_str)
                .map(SessionId::new);
            return Frame::Event {
                method: Cow::Owned(method.to_string()),
                params,
                session_id,
            };
        }

        Frame::Unknown(Bytes::copy_from_slice(raw))
    }
}
