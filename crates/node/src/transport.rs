//! How envelopes travel between nodes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mc_domain::{MeshError, NodeRef};
use mc_protocol::{CallEnvelope, EnvelopeReply};
use parking_lot::RwLock;

/// Anything that can receive a call envelope and produce a reply.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn handle_envelope(&self, envelope: CallEnvelope) -> EnvelopeReply;
}

/// Resolves a callee and delivers an envelope to it.
#[async_trait]
pub trait MeshTransport: Send + Sync + 'static {
    async fn send(&self, callee: &NodeRef, envelope: CallEnvelope) -> Result<EnvelopeReply, MeshError>;
}

type Route = (String, Option<String>);

/// In-process mesh.
///
/// Routes by `(binding, instance)`; a binding may also have a fallback
/// handler that receives every instance without an exact route (the gateway
/// hub registers one for the client binding).  Envelopes and replies are
/// round-tripped through JSON so local calls see exactly what a remote peer
/// would.
#[derive(Default)]
pub struct LocalMesh {
    routes: RwLock<HashMap<Route, Arc<dyn EnvelopeHandler>>>,
    fallbacks: RwLock<HashMap<String, Arc<dyn EnvelopeHandler>>>,
}

impl LocalMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, binding: impl Into<String>, instance: Option<&str>, handler: Arc<dyn EnvelopeHandler>) {
        let route = (binding.into(), instance.map(str::to_owned));
        tracing::debug!(binding = %route.0, instance = ?route.1, "route registered");
        self.routes.write().insert(route, handler);
    }

    pub fn register_fallback(&self, binding: impl Into<String>, handler: Arc<dyn EnvelopeHandler>) {
        self.fallbacks.write().insert(binding.into(), handler);
    }

    pub fn unregister(&self, binding: &str, instance: Option<&str>) -> bool {
        self.routes
            .write()
            .remove(&(binding.to_owned(), instance.map(str::to_owned)))
            .is_some()
    }

    fn resolve(&self, callee: &NodeRef) -> Option<Arc<dyn EnvelopeHandler>> {
        let exact = (callee.binding_name.clone(), callee.instance_name.clone());
        if let Some(h) = self.routes.read().get(&exact) {
            return Some(h.clone());
        }
        self.fallbacks.read().get(&callee.binding_name).cloned()
    }
}

#[async_trait]
impl MeshTransport for LocalMesh {
    async fn send(&self, callee: &NodeRef, envelope: CallEnvelope) -> Result<EnvelopeReply, MeshError> {
        let handler = self
            .resolve(callee)
            .ok_or_else(|| MeshError::Transport(format!("no route to {callee}")))?;
        let envelope: CallEnvelope = serde_json::from_slice(&serde_json::to_vec(&envelope)?)?;
        let reply = handler.handle_envelope(envelope).await;
        Ok(serde_json::from_slice(&serde_json::to_vec(&reply)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_protocol::CallContext;
    use serde_json::{json, Value};

    struct Fixed(Value);

    #[async_trait]
    impl EnvelopeHandler for Fixed {
        async fn handle_envelope(&self, _envelope: CallEnvelope) -> EnvelopeReply {
            EnvelopeReply::Result(self.0.clone())
        }
    }

    fn envelope() -> CallEnvelope {
        CallEnvelope {
            version: Some(1),
            chain: json!([]),
            call_context: Some(CallContext::default()),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn exact_route_beats_fallback() {
        let mesh = LocalMesh::new();
        mesh.register("B", Some("inst-1"), Arc::new(Fixed(json!("exact"))));
        mesh.register_fallback("B", Arc::new(Fixed(json!("fallback"))));

        let exact = mesh.send(&NodeRef::new("B", Some("inst-1")), envelope()).await.unwrap();
        assert_eq!(exact, EnvelopeReply::Result(json!("exact")));

        let other = mesh.send(&NodeRef::new("B", Some("inst-2")), envelope()).await.unwrap();
        assert_eq!(other, EnvelopeReply::Result(json!("fallback")));
    }

    #[tokio::test]
    async fn unknown_callee_is_a_transport_error() {
        let mesh = LocalMesh::new();
        let err = mesh.send(&NodeRef::new("nobody", None::<String>), envelope()).await.unwrap_err();
        assert!(matches!(err, MeshError::Transport(_)));
    }

    #[tokio::test]
    async fn unregister_removes_route() {
        let mesh = LocalMesh::new();
        mesh.register("S", None, Arc::new(Fixed(json!(1))));
        assert!(mesh.unregister("S", None));
        assert!(mesh.send(&NodeRef::new("S", None::<String>), envelope()).await.is_err());
    }
}
