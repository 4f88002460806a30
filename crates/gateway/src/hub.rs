//! Registry of client slots, and the bridge between clients and the mesh.
//!
//! Mesh → client: the hub is registered with the transport as the fallback
//! handler for the client binding, so every envelope addressed to
//! `client/<instance>` lands in [`GatewayHub::handle_envelope`] and is
//! forwarded through that instance's slot.
//!
//! Client → mesh: [`GatewayHub::relay`] rebuilds the outgoing call context
//! from the connection's verified attachment and sends it on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mc_domain::config::GatewayConfig;
use mc_domain::{MeshError, NodeKind, NodeRef};
use mc_node::envelope;
use mc_node::{EnvelopeHandler, MeshTransport};
use mc_protocol::{CallContext, CallEnvelope, EnvelopeReply};
use parking_lot::RwLock;
use serde_json::Value;

use crate::auth::Attachment;
use crate::slot::{ActiveConnection, ClientSlot, ConnectionState, SlotSummary};

pub struct GatewayHub {
    slots: RwLock<HashMap<String, Arc<ClientSlot>>>,
    config: GatewayConfig,
}

impl GatewayHub {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Attach a socket to the slot for `instance`.
    ///
    /// Lookup and attach happen under the registry write lock, so the
    /// pruner never sees the slot between the two.  Returns the slot and
    /// whether the client must re-subscribe.
    pub fn attach(&self, instance: &str, connection: ActiveConnection) -> (Arc<ClientSlot>, bool) {
        let mut slots = self.slots.write();
        let slot = self.entry(&mut slots, instance).clone();
        let subscription_required = slot.attach(connection);
        (slot, subscription_required)
    }

    fn entry<'a>(&self, slots: &'a mut HashMap<String, Arc<ClientSlot>>, instance: &str) -> &'a Arc<ClientSlot> {
        slots.entry(instance.to_owned()).or_insert_with(|| {
            tracing::debug!(instance = %instance, "client slot created");
            ClientSlot::new(
                instance,
                Duration::from_millis(self.config.grace_period_ms),
                Duration::from_millis(self.config.call_timeout_ms),
                self.config.max_pending,
            )
        })
    }

    pub fn get(&self, instance: &str) -> Option<Arc<ClientSlot>> {
        self.slots.read().get(instance).cloned()
    }

    pub fn list(&self) -> Vec<SlotSummary> {
        let mut out: Vec<SlotSummary> = self.slots.read().values().map(|s| s.summary()).collect();
        out.sort_by(|a, b| a.instance.cmp(&b.instance));
        out
    }

    pub fn connected_count(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|s| s.state() == ConnectionState::Connected)
            .count()
    }

    /// Drop slots that are fully disconnected and idle.  Returns how many
    /// were removed.
    pub fn prune_disconnected(&self) -> usize {
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, s| s.state() != ConnectionState::Disconnected || s.pending_calls() > 0);
        let removed = before - slots.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = slots.len(), "pruned idle client slots");
        }
        removed
    }

    /// Periodically prune idle slots for as long as the hub is alive.
    pub fn spawn_pruner(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                match hub.upgrade() {
                    Some(hub) => {
                        hub.prune_disconnected();
                    }
                    None => break,
                }
            }
        })
    }

    /// Fail every in-flight call and close every connection.
    pub fn shutdown(&self) {
        let slots: Vec<_> = self.slots.read().values().cloned().collect();
        for slot in slots {
            slot.shutdown();
        }
    }

    // ── Client → mesh ──────────────────────────────────────────────

    /// Relay a call initiated by a connected client.
    ///
    /// Identity and auth come from `attachment`.  From the client-supplied
    /// context only the state bag and the non-client hops of the call chain
    /// are kept; the verified client identity is appended as the caller.
    pub async fn relay(
        &self,
        transport: &dyn MeshTransport,
        attachment: &Attachment,
        binding: &str,
        instance: Option<&str>,
        chain: Value,
        supplied: Option<CallContext>,
    ) -> Result<Value, MeshError> {
        let context = outgoing_context(attachment, supplied);
        let callee = NodeRef::new(binding, instance);
        let envelope = CallEnvelope::new(chain, context, attachment.identity.clone(), callee.clone());

        tracing::debug!(client = %attachment.identity, %callee, "relaying client call");
        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        match tokio::time::timeout(timeout, transport.send(&callee, envelope)).await {
            Ok(reply) => reply?.into_result(),
            Err(_) => Err(MeshError::Timeout(format!(
                "call to {callee} timed out after {timeout:?}"
            ))),
        }
    }

    // ── Mesh → client ──────────────────────────────────────────────

    async fn deliver(&self, envelope: CallEnvelope) -> Result<Value, MeshError> {
        let incoming = envelope::accept(envelope)?;
        let instance = incoming
            .callee
            .as_ref()
            .and_then(|c| c.instance_name.clone())
            .ok_or_else(|| MeshError::ClientDisconnected("call has no client instance".into()))?;
        let slot = self
            .get(&instance)
            .ok_or_else(|| MeshError::ClientDisconnected(format!("{instance} has never connected")))?;
        slot.forward_call(incoming.chain, incoming.context).await
    }
}

#[async_trait]
impl EnvelopeHandler for GatewayHub {
    async fn handle_envelope(&self, envelope: CallEnvelope) -> EnvelopeReply {
        let outcome = self.deliver(envelope).await;
        if let Err(e) = &outcome {
            tracing::debug!(kind = %e.kind(), error = %e, "call to client failed");
        }
        EnvelopeReply::from_outcome(outcome)
    }
}

fn outgoing_context(attachment: &Attachment, supplied: Option<CallContext>) -> CallContext {
    let supplied = supplied.unwrap_or_default();
    let mut call_chain: Vec<_> = supplied
        .call_chain
        .into_iter()
        .filter(|hop| hop.kind != NodeKind::Client)
        .collect();
    call_chain.push(attachment.identity.clone());
    CallContext {
        call_chain,
        origin_auth: Some(attachment.origin_auth()),
        state: supplied.state,
    }
}
