//! One client connection slot.
//!
//! A slot is the gateway-side stand-in for exactly one client instance.
//! Its [`ConnectionState`] is derived from two facts: whether a socket is
//! attached, and whether a grace timer is armed.
//!
//! ```text
//!   Disconnected ──attach──► Connected ──detach──► GracePeriod ──timer──► Disconnected
//!                                ▲                      │
//!                                └──────attach──────────┘
//! ```
//!
//! Calls that arrive during the grace period wait for either a reconnect or
//! the timer; every transition bumps a generation counter that wakes them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mc_domain::MeshError;
use mc_node::{new_call_id, PendingCalls};
use mc_protocol::{close_code, CallContext, WsMessage};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::auth::Attachment;

/// Something the socket writer task should do.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Message(WsMessage),
    Close { code: u16, reason: String },
}

pub type FrameSink = mpsc::Sender<OutboundFrame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    GracePeriod,
    Disconnected,
}

/// An attached socket.
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    pub id: String,
    pub sink: FrameSink,
    pub attachment: Attachment,
}

struct GraceTimer {
    handle: JoinHandle<()>,
    deadline: DateTime<Utc>,
}

#[derive(Default)]
struct SlotInner {
    connection: Option<ActiveConnection>,
    grace: Option<GraceTimer>,
}

/// Snapshot for the `/v1/clients` listing.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSummary {
    pub instance: String,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_deadline: Option<DateTime<Utc>>,
    pub pending_calls: usize,
}

pub struct ClientSlot {
    instance: String,
    inner: Mutex<SlotInner>,
    generation: watch::Sender<u64>,
    pending: PendingCalls<Value>,
    grace_period: Duration,
    call_timeout: Duration,
}

impl ClientSlot {
    pub fn new(instance: impl Into<String>, grace_period: Duration, call_timeout: Duration, max_pending: usize) -> Arc<Self> {
        Arc::new(Self {
            instance: instance.into(),
            inner: Mutex::new(SlotInner::default()),
            generation: watch::channel(0).0,
            pending: PendingCalls::new(max_pending),
            grace_period,
            call_timeout,
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn state(&self) -> ConnectionState {
        derive_state(&self.inner.lock())
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn summary(&self) -> SlotSummary {
        let inner = self.inner.lock();
        SlotSummary {
            instance: self.instance.clone(),
            state: derive_state(&inner),
            subject: inner.connection.as_ref().map(|c| c.attachment.subject.clone()),
            connected_at: inner.connection.as_ref().map(|c| c.attachment.connected_at),
            grace_deadline: inner.grace.as_ref().map(|g| g.deadline),
            pending_calls: self.pending.len(),
        }
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Attach a freshly upgraded connection, superseding any current one.
    /// Returns whether the client must re-establish session-scoped
    /// subscriptions (true only when the slot was fully disconnected).
    pub fn attach(&self, conn: ActiveConnection) -> bool {
        let conn_id = conn.id.clone();
        let (prior, superseded) = {
            let mut inner = self.inner.lock();
            let prior = derive_state(&inner);
            if let Some(timer) = inner.grace.take() {
                timer.handle.abort();
            }
            let superseded = inner.connection.replace(conn);
            (prior, superseded)
        };

        if let Some(old) = superseded {
            let _ = old.sink.try_send(OutboundFrame::Close {
                code: close_code::SUPERSEDED,
                reason: "superseded by a newer connection".into(),
            });
            let failed = self.pending.fail_tagged(
                &old.id,
                MeshError::ClientDisconnected(format!("{} reconnected", self.instance)),
            );
            tracing::info!(instance = %self.instance, old = %old.id, new = %conn_id, failed, "connection superseded");
        }
        self.bump();

        let subscription_required = prior == ConnectionState::Disconnected;
        tracing::info!(
            instance = %self.instance,
            connection = %conn_id,
            ?prior,
            subscription_required,
            "client attached"
        );
        subscription_required
    }

    /// The socket `conn_id` closed.  A connection that was already
    /// superseded changes nothing; otherwise the slot enters its grace
    /// period (or goes straight to disconnected when there is none).
    pub fn detach(self: &Arc<Self>, conn_id: &str) {
        {
            let mut inner = self.inner.lock();
            match &inner.connection {
                Some(current) if current.id == conn_id => {}
                _ => {
                    tracing::debug!(instance = %self.instance, connection = %conn_id, "superseded connection closed");
                    return;
                }
            }
            inner.connection = None;
            if !self.grace_period.is_zero() {
                let deadline = Utc::now()
                    + chrono::Duration::from_std(self.grace_period).unwrap_or_else(|_| chrono::Duration::zero());
                let handle = tokio::spawn(grace_expiry(Arc::downgrade(self), self.grace_period));
                inner.grace = Some(GraceTimer { handle, deadline });
            }
        }

        let failed = self.pending.fail_tagged(
            conn_id,
            MeshError::ClientDisconnected(format!("{} disconnected", self.instance)),
        );
        self.bump();
        tracing::info!(
            instance = %self.instance,
            connection = %conn_id,
            grace_ms = self.grace_period.as_millis() as u64,
            failed_in_flight = failed,
            "client detached"
        );
    }

    fn expire_grace(&self) {
        let expired = {
            let mut inner = self.inner.lock();
            inner.connection.is_none() && inner.grace.take().is_some()
        };
        if expired {
            self.bump();
            tracing::info!(instance = %self.instance, "grace period expired");
        }
    }

    /// Close the current connection with `code`, if it is still `conn_id`.
    pub fn close(&self, conn_id: &str, code: u16, reason: &str) {
        let sink = {
            let inner = self.inner.lock();
            inner
                .connection
                .as_ref()
                .filter(|c| c.id == conn_id)
                .map(|c| c.sink.clone())
        };
        if let Some(sink) = sink {
            let _ = sink.try_send(OutboundFrame::Close {
                code,
                reason: reason.into(),
            });
        }
    }

    // ── Calls to the client ────────────────────────────────────────

    /// Wait for a live connection, waiting out a grace period if one is
    /// running.
    async fn live_connection(&self) -> Result<ActiveConnection, MeshError> {
        loop {
            let mut changed = self.generation.subscribe();
            {
                let inner = self.inner.lock();
                if let Some(conn) = &inner.connection {
                    return Ok(conn.clone());
                }
                if inner.grace.is_none() {
                    return Err(MeshError::ClientDisconnected(format!(
                        "{} is not connected",
                        self.instance
                    )));
                }
            }
            if changed.changed().await.is_err() {
                return Err(MeshError::ClientDisconnected(self.instance.clone()));
            }
        }
    }

    /// Forward a mesh call to the client and wait for its response.
    pub async fn forward_call(&self, chain: Value, call_context: CallContext) -> Result<Value, MeshError> {
        let conn = self.live_connection().await?;

        if conn.attachment.is_expired() {
            self.close(&conn.id, close_code::CREDENTIAL_EXPIRED, "credential expired");
            return Err(MeshError::ClientDisconnected(format!(
                "{} credential expired",
                self.instance
            )));
        }

        let call_id = new_call_id();
        let settled = self.pending.register_tagged(&call_id, &conn.id, self.call_timeout)?;
        let msg = WsMessage::IncomingCall {
            call_id: call_id.clone(),
            chain,
            call_context,
        };
        if conn.sink.send(OutboundFrame::Message(msg)).await.is_err() {
            self.pending.settle(
                &call_id,
                Err(MeshError::ClientDisconnected(format!("{} went away", self.instance))),
            );
        }
        tracing::debug!(instance = %self.instance, %call_id, "call forwarded to client");

        settled
            .await
            .unwrap_or_else(|_| Err(MeshError::ClientDisconnected(self.instance.clone())))
    }

    /// Deliver the client's `incoming_call_response`.
    pub fn complete(&self, call_id: &str, outcome: Result<Value, MeshError>) -> bool {
        self.pending.settle(call_id, outcome)
    }

    /// Fail everything and drop the connection.  Used on gateway shutdown.
    pub fn shutdown(&self) {
        let (conn, grace) = {
            let mut inner = self.inner.lock();
            (inner.connection.take(), inner.grace.take())
        };
        if let Some(grace) = grace {
            grace.handle.abort();
        }
        if let Some(conn) = conn {
            let _ = conn.sink.try_send(OutboundFrame::Close {
                code: close_code::NORMAL,
                reason: "gateway shutting down".into(),
            });
        }
        self.pending
            .fail_all(MeshError::ClientDisconnected("gateway shutting down".into()));
        self.bump();
    }
}

fn derive_state(inner: &SlotInner) -> ConnectionState {
    match (&inner.connection, &inner.grace) {
        (Some(_), _) => ConnectionState::Connected,
        (None, Some(_)) => ConnectionState::GracePeriod,
        (None, None) => ConnectionState::Disconnected,
    }
}

async fn grace_expiry(slot: Weak<ClientSlot>, after: Duration) {
    tokio::time::sleep(after).await;
    if let Some(slot) = slot.upgrade() {
        slot.expire_grace();
    }
}
