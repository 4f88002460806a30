//! Wire protocol: the node-to-node call envelope and the gateway↔client
//! WebSocket messages.
//!
//! Only the operation chain, results, errors and the context `state` bag
//! carry arbitrary values; identities and call ids are plain fields.

pub mod ws;

use mc_domain::{MeshError, NodeIdentity, NodeRef, WireError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use ws::{close_code, response_outcome, WsMessage};

/// The only envelope version this build understands.
pub const PROTOCOL_VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Call context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Verified identity of whoever started a causal call path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginAuth {
    pub subject: String,
    #[serde(default)]
    pub claims: Map<String, Value>,
}

/// Causal context carried with every call.
///
/// `call_chain[0]` is the origin and the last entry is the immediate caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    #[serde(default)]
    pub call_chain: Vec<NodeIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_auth: Option<OriginAuth>,
    #[serde(default)]
    pub state: Map<String, Value>,
}

impl CallContext {
    pub fn origin(&self) -> Option<&NodeIdentity> {
        self.call_chain.first()
    }

    /// The node that made the call currently executing.
    pub fn caller(&self) -> Option<&NodeIdentity> {
        self.call_chain.last()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<NodeIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callee: Option<NodeRef>,
}

/// Versioned node-to-node request.
///
/// Every field a peer might omit is optional here so that validation can
/// report *what* is missing instead of failing to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnvelope {
    #[serde(default)]
    pub version: Option<u32>,
    /// Encoded operation chain.
    pub chain: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_context: Option<CallContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
}

impl CallEnvelope {
    /// A current-version envelope.
    pub fn new(chain: Value, context: CallContext, caller: NodeIdentity, callee: NodeRef) -> Self {
        Self {
            version: Some(PROTOCOL_VERSION),
            chain,
            call_context: Some(context),
            metadata: Some(EnvelopeMetadata {
                caller: Some(caller),
                callee: Some(callee),
            }),
        }
    }

    pub fn callee(&self) -> Option<&NodeRef> {
        self.metadata.as_ref().and_then(|m| m.callee.as_ref())
    }
}

/// Reply to a [`CallEnvelope`]: `{"result": ...}` or `{"error": {...}}`.
///
/// Failures are always returned, never raised across the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeReply {
    Result(Value),
    Error(WireError),
}

impl EnvelopeReply {
    pub fn from_outcome(outcome: Result<Value, MeshError>) -> Self {
        match outcome {
            Ok(v) => EnvelopeReply::Result(v),
            Err(e) => EnvelopeReply::Error(e.to_wire()),
        }
    }

    /// Unwrap on the calling side, re-raising a returned error.
    pub fn into_result(self) -> Result<Value, MeshError> {
        match self {
            EnvelopeReply::Result(v) => Ok(v),
            EnvelopeReply::Error(e) => Err(MeshError::from_wire(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wire_shape() {
        let ctx = CallContext {
            call_chain: vec![NodeIdentity::stateless("A")],
            origin_auth: None,
            state: Map::new(),
        };
        let env = CallEnvelope::new(
            json!([{ "type": "get", "key": "ping" }]),
            ctx,
            NodeIdentity::stateless("A"),
            NodeRef::new("B", Some("inst-1")),
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["version"], json!(1));
        assert_eq!(v["callContext"]["callChain"][0]["bindingName"], json!("A"));
        assert_eq!(v["metadata"]["callee"]["instanceName"], json!("inst-1"));
        let back: CallEnvelope = serde_json::from_value(v).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn missing_fields_decode_as_none() {
        let env: CallEnvelope = serde_json::from_value(json!({ "chain": [] })).unwrap();
        assert_eq!(env.version, None);
        assert!(env.call_context.is_none());
        assert!(env.callee().is_none());
    }

    #[test]
    fn reply_shapes() {
        let ok = EnvelopeReply::from_outcome(Ok(json!(84)));
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({ "result": 84 }));

        let err = EnvelopeReply::from_outcome(Err(MeshError::NotCallable("reset".into())));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v["error"]["kind"], json!("not_callable"));
        assert_eq!(err.into_result(), Err(MeshError::NotCallable("reset".into())));
    }

    #[test]
    fn application_error_keeps_custom_fields() {
        let raised = MeshError::Application {
            name: "QuotaExceeded".into(),
            message: "limit hit".into(),
            data: Some(json!({ "limit": 10 })),
        };
        let text = serde_json::to_string(&EnvelopeReply::from_outcome(Err(raised.clone()))).unwrap();
        let back: EnvelopeReply = serde_json::from_str(&text).unwrap();
        assert_eq!(back.into_result(), Err(raised));
    }

    #[test]
    fn context_origin_and_caller() {
        let ctx = CallContext {
            call_chain: vec![NodeIdentity::client("client", "ada.phone"), NodeIdentity::stateless("api")],
            ..Default::default()
        };
        assert_eq!(ctx.origin().map(|i| i.binding_name.as_str()), Some("client"));
        assert_eq!(ctx.caller().map(|i| i.binding_name.as_str()), Some("api"));
    }
}
