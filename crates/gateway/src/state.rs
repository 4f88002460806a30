use std::sync::Arc;
use std::time::Instant;

use mc_domain::config::Config;
use mc_node::{LocalMesh, MeshNode};

use crate::auth::{CredentialVerifier, HmacTokenVerifier, RejectAll};
use crate::echo;
use crate::hub::GatewayHub;

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<GatewayHub>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub mesh: Arc<LocalMesh>,
    /// Built-in nodes hosted by this process, kept for draining on shutdown.
    pub nodes: Vec<Arc<MeshNode>>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the mesh: the hub answers for every client instance and the
    /// built-in nodes are registered under their bindings.
    pub fn build(config: Arc<Config>, verifier: Arc<dyn CredentialVerifier>) -> Self {
        let mesh = LocalMesh::new();
        let hub = Arc::new(GatewayHub::new(config.gateway.clone()));
        mesh.register_fallback(config.gateway.client_binding.clone(), hub.clone());

        let echo = echo::node(&config, mesh.clone());
        mesh.register(echo::BINDING, None, echo.clone());

        Self {
            config,
            hub,
            verifier,
            mesh,
            nodes: vec![echo],
            started_at: Instant::now(),
        }
    }

    /// Build with the verifier configured by `[auth]`.  Without a secret
    /// every client upgrade is refused.
    pub fn from_config(config: Arc<Config>) -> Self {
        let verifier: Arc<dyn CredentialVerifier> = match HmacTokenVerifier::from_env(&config.auth.secret_env) {
            Some(v) => Arc::new(v),
            None => {
                tracing::warn!(
                    env = %config.auth.secret_env,
                    "no token secret configured; client connections will be refused"
                );
                Arc::new(RejectAll)
            }
        };
        Self::build(config, verifier)
    }

    /// Fail in-flight client calls and wait for built-in nodes to finish
    /// their fire-and-forget work.
    pub async fn shutdown(&self) {
        self.hub.shutdown();
        for node in &self.nodes {
            node.wait_idle().await;
        }
    }
}
