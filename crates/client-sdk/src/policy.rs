//! Which incoming calls a client is willing to execute.

use mc_domain::{MeshError, NodeIdentity, NodeKind};
use mc_protocol::CallContext;

pub trait IncomingCallPolicy: Send + Sync + 'static {
    /// Decide on an incoming call before anything executes.  `me` is this
    /// client's own identity.
    fn check(&self, me: &NodeIdentity, context: &CallContext) -> Result<(), MeshError>;
}

/// Rejects calls that originate from another client.  Calls from mesh
/// nodes, and calls that originate from this very client instance, pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SameClientOnly;

impl IncomingCallPolicy for SameClientOnly {
    fn check(&self, me: &NodeIdentity, context: &CallContext) -> Result<(), MeshError> {
        match context.origin() {
            Some(origin) if origin.kind == NodeKind::Client && origin != me => Err(MeshError::GuardRejected {
                method: "incoming_call".into(),
                reason: format!("calls originating from client {origin} are not accepted"),
            }),
            _ => Ok(()),
        }
    }
}

/// Accepts everything.  For clients that deliberately take peer calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl IncomingCallPolicy for AllowAll {
    fn check(&self, _me: &NodeIdentity, _context: &CallContext) -> Result<(), MeshError> {
        Ok(())
    }
}
