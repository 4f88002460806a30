//! Gateway ↔ client WebSocket messages.

use mc_domain::{MeshError, WireError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CallContext;

/// Close codes with meaning beyond "the socket went away".
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    /// A newer connection took over this slot; no grace period follows.
    pub const SUPERSEDED: u16 = 4000;
    /// The connection's credential expired; reconnect with a fresh token.
    pub const CREDENTIAL_EXPIRED: u16 = 4401;
}

/// WebSocket message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WsMessage {
    /// Client → Gateway: call a mesh node.
    Call {
        call_id: String,
        binding: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance: Option<String>,
        chain: Value,
        /// Client-supplied context tail. Only `state` and the `callChain`
        /// entries that are not clients are honoured.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_context: Option<CallContext>,
        /// No `call_response` is sent back.
        #[serde(default)]
        one_way: bool,
    },

    /// Gateway → Client: outcome of a `call`.
    CallResponse {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },

    /// Gateway → Client: a mesh node is calling this client.
    IncomingCall {
        call_id: String,
        chain: Value,
        call_context: CallContext,
    },

    /// Client → Gateway: outcome of an `incoming_call`.
    IncomingCallResponse {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },

    /// Gateway → Client: first message after every upgrade.
    ConnectionStatus { subscription_required: bool },

    /// Bidirectional: heartbeat.
    Ping { timestamp: i64 },

    /// Bidirectional: heartbeat response.
    Pong { timestamp: i64 },
}

impl WsMessage {
    pub fn call_response(call_id: impl Into<String>, outcome: Result<Value, MeshError>) -> Self {
        let (result, error) = split(outcome);
        WsMessage::CallResponse {
            call_id: call_id.into(),
            result,
            error,
        }
    }

    pub fn incoming_call_response(call_id: impl Into<String>, outcome: Result<Value, MeshError>) -> Self {
        let (result, error) = split(outcome);
        WsMessage::IncomingCallResponse {
            call_id: call_id.into(),
            result,
            error,
        }
    }

    pub fn to_text(&self) -> Result<String, MeshError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, MeshError> {
        Ok(serde_json::from_str(text)?)
    }
}

fn split(outcome: Result<Value, MeshError>) -> (Option<Value>, Option<WireError>) {
    match outcome {
        Ok(v) => (Some(v), None),
        Err(e) => (None, Some(e.to_wire())),
    }
}

/// Recover the outcome carried by a response message.  An absent result
/// with no error is a `null` result.
pub fn response_outcome(result: Option<Value>, error: Option<WireError>) -> Result<Value, MeshError> {
    match error {
        Some(e) => Err(MeshError::from_wire(e)),
        None => Ok(result.unwrap_or(Value::Null)),
    }
}
