//! Client state, errors, and credential sources.

use std::sync::Arc;

use async_trait::async_trait;
use mc_domain::MeshError;

/// Lifecycle of the client's connection to its gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// First connection attempt in progress.
    Connecting,
    Connected,
    /// Lost the connection; waiting out back-off or re-dialling.
    Reconnecting,
    /// Stopped for good (shutdown or reconnects exhausted).
    Disconnected,
}

/// Top-level SDK error.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("config: {0}")]
    Config(String),
    /// A call failed; carries the mesh error kind.
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error("outbound queue full ({0} messages)")]
    QueueFull(usize),
    #[error("websocket: {0}")]
    WebSocket(String),
    #[error("token: {0}")]
    Token(String),
    #[error("reconnect exhausted after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("shutdown")]
    Shutdown,
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::WebSocket(e.to_string())
    }
}

/// Source of bearer credentials.  Consulted on every connection attempt;
/// `force_refresh` is set after the gateway closed the previous
/// connection because its credential expired.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn token(&self, force_refresh: bool) -> Result<String, ClientError>;
}

/// A fixed token.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self, _force_refresh: bool) -> Result<String, ClientError> {
        Ok(self.0.clone())
    }
}

/// Invoked with `subscription_required` from every `connection_status`.
pub type ConnectionStatusCallback = Arc<dyn Fn(bool) + Send + Sync>;
