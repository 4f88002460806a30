//! The per-node facade: receiving envelopes and calling other nodes.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use mc_chain::{
    execute_operation_chain, execute_with_result, marker, Continuation, ExecuteOptions,
    OperationChain, Target,
};
use mc_domain::config::Config;
use mc_domain::{MeshError, NodeIdentity, NodeKind, NodeRef};
use mc_protocol::{CallContext, CallEnvelope, EnvelopeReply};
use serde_json::Value;
use tokio_util::task::TaskTracker;

use crate::context::{self, CallOptions};
use crate::envelope;
use crate::transport::{EnvelopeHandler, MeshTransport};

/// Tunables for a node.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    /// Default timeout for outgoing calls.
    pub call_timeout: Duration,
    pub execute: ExecuteOptions,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            execute: ExecuteOptions::default(),
        }
    }
}

impl From<&Config> for NodeConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            call_timeout: Duration::from_millis(cfg.gateway.call_timeout_ms),
            execute: ExecuteOptions::from(&cfg.chain),
        }
    }
}

/// Hooks a node may run around inbound calls.
#[async_trait]
pub trait NodeHooks: Send + Sync + 'static {
    /// Runs inside the caller's context before the chain executes.  An
    /// error rejects the call.
    async fn on_before_call(&self, _context: &CallContext) -> Result<(), MeshError> {
        Ok(())
    }
}

/// A mesh participant.
///
/// Identity is bind-once: the binding and instance names may be supplied at
/// construction or learned from the first inbound envelope, and never change
/// afterwards.
pub struct MeshNode {
    kind: NodeKind,
    binding: OnceLock<String>,
    instance: OnceLock<String>,
    target: Arc<dyn Target>,
    hooks: Option<Arc<dyn NodeHooks>>,
    transport: Arc<dyn MeshTransport>,
    config: NodeConfig,
    tasks: TaskTracker,
}

impl MeshNode {
    pub fn new(kind: NodeKind, target: Arc<dyn Target>, transport: Arc<dyn MeshTransport>) -> Self {
        Self {
            kind,
            binding: OnceLock::new(),
            instance: OnceLock::new(),
            target,
            hooks: None,
            transport,
            config: NodeConfig::default(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_binding(self, binding: impl Into<String>) -> Self {
        Self {
            binding: OnceLock::from(binding.into()),
            ..self
        }
    }

    pub fn with_instance(self, instance: impl Into<String>) -> Self {
        Self {
            instance: OnceLock::from(instance.into()),
            ..self
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn NodeHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn binding(&self) -> Option<&str> {
        self.binding.get().map(String::as_str)
    }

    pub fn instance(&self) -> Option<&str> {
        self.instance.get().map(String::as_str)
    }

    /// Full identity, once the binding name is known.
    pub fn identity(&self) -> Option<NodeIdentity> {
        Some(NodeIdentity {
            kind: self.kind,
            binding_name: self.binding()?.to_owned(),
            instance_name: self.instance().map(str::to_owned),
        })
    }

    /// Bind this node's identity.  Binding again to the same names is a
    /// no-op; binding to different names fails and leaves the stored
    /// identity untouched.  Stateless nodes have no instance; one offered
    /// to them is ignored.
    pub fn bind(&self, binding: &str, instance: Option<&str>) -> Result<(), MeshError> {
        let instance = match self.kind {
            NodeKind::StatelessNode => {
                if let Some(offered) = instance {
                    tracing::debug!(binding, instance = offered, "ignoring instance name for a stateless node");
                }
                None
            }
            _ => instance,
        };
        check_compatible(&self.binding, binding)?;
        if let Some(instance) = instance {
            check_compatible(&self.instance, instance)?;
        }
        bind_once(&self.binding, binding)?;
        if let Some(instance) = instance {
            bind_once(&self.instance, instance)?;
        }
        Ok(())
    }

    // ── Inbound ────────────────────────────────────────────────────

    /// Validate, auto-bind, execute, and wrap.  Never panics across the
    /// boundary: failures come back as an `{error}` reply.
    pub async fn receive_envelope(&self, envelope: CallEnvelope) -> EnvelopeReply {
        let outcome = self.dispatch(envelope).await;
        if let Err(e) = &outcome {
            tracing::debug!(node = ?self.identity(), kind = %e.kind(), error = %e, "inbound call failed");
        }
        EnvelopeReply::from_outcome(outcome)
    }

    async fn dispatch(&self, envelope: CallEnvelope) -> Result<Value, MeshError> {
        let incoming = envelope::accept(envelope)?;
        if let Some(callee) = &incoming.callee {
            self.bind(&callee.binding_name, callee.instance_name.as_deref())?;
        }
        let chain = incoming.decode_chain()?;

        let target = self.target.clone();
        let hooks = self.hooks.clone();
        let options = self.config.execute;
        let context = incoming.context;
        let hook_context = context.clone();

        let run = async move {
            if let Some(hooks) = hooks {
                hooks.on_before_call(&hook_context).await?;
            }
            execute_operation_chain(&chain, target, &options).await
        };

        match AssertUnwindSafe(context::run_with(context, run)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "method panicked".into());
                tracing::error!(node = ?self.identity(), %message, "method panicked");
                Err(MeshError::application("Panic", message))
            }
        }
    }

    // ── Outbound ───────────────────────────────────────────────────

    /// Call `binding`/`instance` and wait for the reply.
    pub async fn call_raw(
        &self,
        binding: &str,
        instance: Option<&str>,
        chain: &OperationChain,
        options: &CallOptions,
    ) -> Result<Value, MeshError> {
        let caller = self.identity().ok_or_else(|| {
            MeshError::UnknownIdentity(format!("{} node has no binding name yet", self.kind))
        })?;
        let callee = NodeRef::new(binding, instance);
        let context = context::build_outgoing(&caller, options);
        let envelope = envelope::seal(chain, context, caller, callee.clone());

        let timeout = options.timeout.unwrap_or(self.config.call_timeout);
        match tokio::time::timeout(timeout, self.transport.send(&callee, envelope)).await {
            Ok(reply) => reply?.into_result(),
            Err(_) => Err(MeshError::Timeout(format!(
                "call to {callee} timed out after {timeout:?}"
            ))),
        }
    }

    /// Fire-and-forget call.  Returns immediately; the remote call and the
    /// optional local `handler` run on a tracked background task inside the
    /// context captured here.
    ///
    /// The handler's `$result` placeholder is replaced by the remote result,
    /// or by an error value if the call failed, and the handler executes
    /// against this node's own target with the callable policy bypassed.
    pub fn call(
        self: &Arc<Self>,
        binding: impl Into<String>,
        instance: Option<String>,
        remote: &Continuation,
        handler: Option<Continuation>,
        options: CallOptions,
    ) {
        let node = Arc::clone(self);
        let binding = binding.into();
        let chain = remote.chain().clone();

        let task = async move {
            let outcome = node.call_raw(&binding, instance.as_deref(), &chain, &options).await;
            let callee = NodeRef::new(binding, instance);
            node.run_handler(&callee, handler, outcome).await;
        };

        match context::capture() {
            Some(captured) => self.tasks.spawn(context::run_with(captured, task)),
            None => self.tasks.spawn(task),
        };
    }

    async fn run_handler(&self, callee: &NodeRef, handler: Option<Continuation>, outcome: Result<Value, MeshError>) {
        let Some(handler) = handler else {
            if let Err(e) = outcome {
                tracing::debug!(%callee, kind = %e.kind(), error = %e, "fire-and-forget call failed");
            }
            return;
        };
        let value = match outcome {
            Ok(v) => v,
            Err(e) => marker::error_value(&e),
        };
        let options = self.config.execute.trusted();
        if let Err(e) = execute_with_result(handler.chain(), self.target.clone(), &options, &value).await {
            tracing::warn!(%callee, kind = %e.kind(), error = %e, "handler continuation failed");
        }
    }

    /// Number of fire-and-forget tasks still running.
    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every fire-and-forget task spawned so far.  A stateless host
    /// calls this before tearing the node down.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

#[async_trait]
impl EnvelopeHandler for MeshNode {
    async fn handle_envelope(&self, envelope: CallEnvelope) -> EnvelopeReply {
        self.receive_envelope(envelope).await
    }
}

fn check_compatible(slot: &OnceLock<String>, value: &str) -> Result<(), MeshError> {
    match slot.get() {
        Some(bound) if bound != value => Err(MeshError::IdentityMismatch {
            bound: bound.clone(),
            received: value.to_owned(),
        }),
        _ => Ok(()),
    }
}

fn bind_once(slot: &OnceLock<String>, value: &str) -> Result<(), MeshError> {
    let bound = slot.get_or_init(|| value.to_owned());
    if bound == value {
        Ok(())
    } else {
        Err(MeshError::IdentityMismatch {
            bound: bound.clone(),
            received: value.to_owned(),
        })
    }
}
