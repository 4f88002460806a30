//! Builder pattern for constructing a [`MeshClient`].

use std::sync::Arc;
use std::time::Duration;

use mc_chain::{ExecuteOptions, Target};

use crate::client::{ClientSettings, MeshClient};
use crate::policy::{IncomingCallPolicy, SameClientOnly};
use crate::reconnect::ReconnectBackoff;
use crate::types::{ClientError, ConnectionStatusCallback, StaticToken, TokenProvider};

/// Fluent builder for [`MeshClient`].
///
/// # Example
///
/// ```rust,no_run
/// # use mc_client::MeshClientBuilder;
/// # async fn demo() -> Result<(), mc_client::ClientError> {
/// let client = MeshClientBuilder::new()
///     .gateway_ws_url("ws://localhost:3210/v1/clients/ws")
///     .instance("ada.phone")
///     .token("ada.1767225600.4f2a...")
///     .on_connection_status(|resubscribe| {
///         if resubscribe {
///             // re-establish session-scoped subscriptions
///         }
///     })
///     .spawn()?;
/// # let _ = client;
/// # Ok(())
/// # }
/// ```
pub struct MeshClientBuilder {
    gateway_ws_url: String,
    instance: Option<String>,
    client_binding: String,
    tokens: Option<Arc<dyn TokenProvider>>,
    target: Option<Arc<dyn Target>>,
    policy: Arc<dyn IncomingCallPolicy>,
    execute: ExecuteOptions,
    reconnect_backoff: ReconnectBackoff,
    heartbeat_interval: Duration,
    queue_capacity: usize,
    queue_message_timeout: Duration,
    call_timeout: Duration,
    max_message_bytes: usize,
    on_connection_status: Option<ConnectionStatusCallback>,
}

impl MeshClientBuilder {
    pub fn new() -> Self {
        Self {
            gateway_ws_url: "ws://localhost:3210/v1/clients/ws".into(),
            instance: None,
            client_binding: "client".into(),
            tokens: None,
            target: None,
            policy: Arc::new(SameClientOnly),
            execute: ExecuteOptions::default(),
            reconnect_backoff: ReconnectBackoff::default(),
            heartbeat_interval: Duration::from_secs(30),
            queue_capacity: 100,
            queue_message_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            max_message_bytes: 1024 * 1024,
            on_connection_status: None,
        }
    }

    // ── Required ─────────────────────────────────────────────────────

    /// Set the gateway WebSocket URL (e.g. `wss://gw.example.com/v1/clients/ws`).
    pub fn gateway_ws_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_ws_url = url.into();
        self
    }

    /// This client's instance name, `"<subject>.<suffix>"`.
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Use a fixed bearer token.
    pub fn token(self, token: impl Into<String>) -> Self {
        self.token_provider(Arc::new(StaticToken(token.into())))
    }

    /// Fetch a bearer token on every connection attempt.
    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(provider);
        self
    }

    // ── Incoming calls ───────────────────────────────────────────────

    /// Target that incoming calls execute against.  Without one, every
    /// incoming call is answered with `NotCallable`.
    pub fn target(mut self, target: Arc<dyn Target>) -> Self {
        self.target = Some(target);
        self
    }

    /// Override the incoming-call policy (default [`SameClientOnly`]).
    pub fn incoming_policy(mut self, policy: Arc<dyn IncomingCallPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Chain limits applied to incoming calls.
    pub fn execute_options(mut self, options: ExecuteOptions) -> Self {
        self.execute = options;
        self
    }

    /// Binding the gateway addresses clients under (default `"client"`).
    pub fn client_binding(mut self, binding: impl Into<String>) -> Self {
        self.client_binding = binding.into();
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    pub fn reconnect_backoff(mut self, cfg: ReconnectBackoff) -> Self {
        self.reconnect_backoff = cfg;
        self
    }

    /// Heartbeat interval (default 30s).  `Duration::ZERO` disables pings.
    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    /// Messages held while disconnected (default 100).
    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    /// How long a message may wait in the queue (default 30s).
    pub fn queue_message_timeout(mut self, d: Duration) -> Self {
        self.queue_message_timeout = d;
        self
    }

    /// How long a sent call may wait for its response (default 30s).
    pub fn call_timeout(mut self, d: Duration) -> Self {
        self.call_timeout = d;
        self
    }

    /// Inbound frames larger than this are dropped (default 1 MB).
    pub fn max_message_bytes(mut self, n: usize) -> Self {
        self.max_message_bytes = n;
        self
    }

    /// Called with `subscription_required` after every (re)connect.
    pub fn on_connection_status(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_connection_status = Some(Arc::new(f));
        self
    }

    /// Validate and start the connection loop on the current runtime.
    pub fn spawn(self) -> Result<MeshClient, ClientError> {
        if self.gateway_ws_url.is_empty() {
            return Err(ClientError::Config("gateway_ws_url is required".into()));
        }
        let instance = self
            .instance
            .filter(|i| !i.is_empty())
            .ok_or_else(|| ClientError::Config("instance is required".into()))?;
        let tokens = self
            .tokens
            .ok_or_else(|| ClientError::Config("a token or token provider is required".into()))?;
        if self.queue_capacity == 0 {
            return Err(ClientError::Config("queue_capacity must be greater than 0".into()));
        }

        Ok(MeshClient::spawn(ClientSettings {
            gateway_ws_url: self.gateway_ws_url,
            instance,
            client_binding: self.client_binding,
            tokens,
            target: self.target,
            policy: self.policy,
            execute: self.execute,
            reconnect_backoff: self.reconnect_backoff,
            heartbeat_interval: self.heartbeat_interval,
            queue_capacity: self.queue_capacity,
            queue_message_timeout: self.queue_message_timeout,
            call_timeout: self.call_timeout,
            max_message_bytes: self.max_message_bytes,
            on_connection_status: self.on_connection_status,
        }))
    }
}

impl Default for MeshClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_instance_or_token_is_a_config_error() {
        let err = MeshClientBuilder::new().token("t").spawn().unwrap_err();
        assert!(matches!(err, ClientError::Config(m) if m.contains("instance")));

        let err = MeshClientBuilder::new().instance("ada.phone").spawn().unwrap_err();
        assert!(matches!(err, ClientError::Config(m) if m.contains("token")));
    }
}
