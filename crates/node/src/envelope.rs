//! Envelope validation and sealing.

use mc_chain::OperationChain;
use mc_domain::{MeshError, NodeIdentity, NodeRef};
use mc_protocol::{CallContext, CallEnvelope, PROTOCOL_VERSION};
use serde_json::Value;

/// A validated inbound envelope.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub context: CallContext,
    pub caller: Option<NodeIdentity>,
    pub callee: Option<NodeRef>,
    /// Still encoded; decoded only after the receiver's identity is settled.
    pub chain: Value,
}

impl Incoming {
    pub fn decode_chain(&self) -> Result<OperationChain, MeshError> {
        OperationChain::from_value(self.chain.clone())
    }
}

/// Check version and context.  Nothing is executed for a rejected envelope.
pub fn accept(envelope: CallEnvelope) -> Result<Incoming, MeshError> {
    match envelope.version {
        Some(PROTOCOL_VERSION) => {}
        other => return Err(MeshError::UnsupportedVersion(other)),
    }
    let context = envelope.call_context.ok_or(MeshError::MissingContext)?;
    let (caller, callee) = match envelope.metadata {
        Some(m) => (m.caller, m.callee),
        None => (None, None),
    };
    Ok(Incoming {
        context,
        caller,
        callee,
        chain: envelope.chain,
    })
}

/// Build an outbound envelope for `chain`.
pub fn seal(chain: &OperationChain, context: CallContext, caller: NodeIdentity, callee: NodeRef) -> CallEnvelope {
    CallEnvelope::new(chain.to_value(), context, caller, callee)
}
