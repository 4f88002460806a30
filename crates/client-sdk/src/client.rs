//! Core client: manages the WebSocket lifecycle, the outbound queue, and
//! execution of incoming calls.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{FutureExt, SinkExt, Stream, StreamExt};
use mc_chain::{execute_operation_chain, ExecuteOptions, OperationChain, Target};
use mc_domain::{MeshError, NodeIdentity};
use mc_node::{context, new_call_id, PendingCalls, Settlement};
use mc_protocol::{close_code, response_outcome, CallContext, WsMessage};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::policy::IncomingCallPolicy;
use crate::queue::{LiveLink, OutboundQueue, Submitted};
use crate::reconnect::{NextAttempt, ReconnectBackoff, Reconnector};
use crate::types::{ClientError, ClientState, ConnectionStatusCallback, TokenProvider};

/// How long the gateway has to send `connection_status` after the upgrade.
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PENDING: usize = 1024;

pub(crate) struct ClientSettings {
    pub gateway_ws_url: String,
    pub instance: String,
    pub client_binding: String,
    pub tokens: Arc<dyn TokenProvider>,
    pub target: Option<Arc<dyn Target>>,
    pub policy: Arc<dyn IncomingCallPolicy>,
    pub execute: ExecuteOptions,
    pub reconnect_backoff: ReconnectBackoff,
    pub heartbeat_interval: Duration,
    pub queue_capacity: usize,
    pub queue_message_timeout: Duration,
    pub call_timeout: Duration,
    pub max_message_bytes: usize,
    pub on_connection_status: Option<ConnectionStatusCallback>,
}

struct Shared {
    settings: ClientSettings,
    identity: NodeIdentity,
    state: watch::Sender<ClientState>,
    pending: PendingCalls<Value>,
    outbox: Mutex<OutboundQueue>,
    wake: Notify,
}

/// Handle to a running client.  Cheap to clone; every clone drives the
/// same connection.
///
/// Create via [`MeshClientBuilder`](crate::builder::MeshClientBuilder).
#[derive(Clone)]
pub struct MeshClient {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<Result<(), ClientError>>>>>,
}

impl std::fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClient").finish_non_exhaustive()
    }
}

impl MeshClient {
    pub fn builder() -> crate::builder::MeshClientBuilder {
        crate::builder::MeshClientBuilder::new()
    }

    pub(crate) fn spawn(settings: ClientSettings) -> Self {
        let shared = Arc::new(Shared::new(settings));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(shared.clone(), shutdown.clone()));
        Self {
            shared,
            shutdown,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// This client's identity as the mesh sees it.
    pub fn identity(&self) -> &NodeIdentity {
        &self.shared.identity
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.shared.state.subscribe()
    }

    /// Messages waiting for a connection.
    pub fn queued(&self) -> usize {
        self.shared.outbox.lock().len()
    }

    /// Reconnect now instead of waiting out the back-off, and start the
    /// back-off over.  Call on foreground or network-online transitions.
    pub fn wake(&self) {
        self.shared.wake();
    }

    /// Call a mesh node through the gateway and wait for the result.
    ///
    /// While disconnected the call is queued; it fails with `Timeout` if it
    /// is still queued after the queue message timeout.
    pub async fn call(&self, binding: &str, instance: Option<&str>, chain: &OperationChain) -> Result<Value, ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(MeshError::ClientDisconnected("client is shut down".into()).into());
        }
        let shared = &self.shared;
        let settings = &shared.settings;
        let call_id = new_call_id();

        let message = outgoing(&call_id, binding, instance, chain, false);
        let (mut settled, submitted) = shared.submit_call(&call_id, message)?;
        match submitted {
            Ok(Submitted::Sent) => {}
            Ok(Submitted::Queued) => {
                tracing::debug!(%call_id, %binding, "gateway unreachable; call queued");
                tokio::select! {
                    outcome = &mut settled => return into_result(outcome),
                    _ = tokio::time::sleep(settings.queue_message_timeout) => {}
                }
                if shared.outbox.lock().withdraw(&call_id) {
                    shared.pending.settle(
                        &call_id,
                        Err(MeshError::Timeout(format!("call to {binding} expired in the outbound queue"))),
                    );
                }
            }
            Err(e) => {
                shared
                    .pending
                    .settle(&call_id, Err(MeshError::Overloaded("outbound queue full".into())));
                return Err(e);
            }
        }
        into_result(settled.await)
    }

    /// Send a call without waiting for (or receiving) a result.
    pub fn call_one_way(&self, binding: &str, instance: Option<&str>, chain: &OperationChain) -> Result<(), ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(MeshError::ClientDisconnected("client is shut down".into()).into());
        }
        let call_id = new_call_id();
        let message = outgoing(&call_id, binding, instance, chain, true);
        self.shared.outbox.lock().submit(&call_id, message, false)?;
        Ok(())
    }

    /// Stop the connection loop and fail every pending or queued call with
    /// `ClientDisconnected`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) | Ok(Err(ClientError::Shutdown)) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "client loop had already stopped"),
                Err(e) => tracing::warn!(error = %e, "client loop panicked"),
            }
        }
    }
}

fn outgoing(call_id: &str, binding: &str, instance: Option<&str>, chain: &OperationChain, one_way: bool) -> WsMessage {
    WsMessage::Call {
        call_id: call_id.to_owned(),
        binding: binding.to_owned(),
        instance: instance.map(str::to_owned),
        chain: chain.to_value(),
        // Inside an incoming call this carries the causal chain onward.
        call_context: context::capture(),
        one_way,
    }
}

fn into_result(settled: Result<Result<Value, MeshError>, oneshot::error::RecvError>) -> Result<Value, ClientError> {
    match settled {
        Ok(outcome) => outcome.map_err(ClientError::from),
        Err(_) => Err(MeshError::ClientDisconnected("client is shut down".into()).into()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Shared {
    fn wake(&self) {
        // No stored permit: a wake while connected must not shorten a
        // later back-off.
        self.wake.notify_waiters();
    }

    fn new(settings: ClientSettings) -> Self {
        let identity = NodeIdentity::client(&settings.client_binding, &settings.instance);
        let outbox = OutboundQueue::new(settings.queue_capacity, settings.queue_message_timeout);
        Self {
            identity,
            state: watch::channel(ClientState::Connecting).0,
            pending: PendingCalls::new(MAX_PENDING.max(settings.queue_capacity)),
            outbox: Mutex::new(outbox),
            wake: Notify::new(),
            settings,
        }
    }

    /// Register a reply slot for `call_id` and hand `message` to the
    /// outbox.  A call that can go out now gets `call_timeout`; a queued
    /// call also gets the queue message timeout.  Both are decided under
    /// one outbox lock so a connection flip cannot split them.
    fn submit_call(
        &self,
        call_id: &str,
        message: WsMessage,
    ) -> Result<(Settlement<Value>, Result<Submitted, ClientError>), ClientError> {
        let mut outbox = self.outbox.lock();
        let budget = if outbox.is_live() {
            self.settings.call_timeout
        } else {
            self.settings.queue_message_timeout + self.settings.call_timeout
        };
        let settled = self.pending.register(call_id, budget)?;
        let submitted = outbox.submit(call_id, message, true);
        Ok((settled, submitted))
    }

    fn set_state(&self, next: ClientState) {
        let changed = self.state.send_if_modified(|s| {
            let changed = *s != next;
            *s = next;
            changed
        });
        if changed {
            tracing::debug!(instance = %self.settings.instance, state = ?next, "client state changed");
        }
    }

    fn fail_everything(&self, reason: &str) {
        let dropped = self.outbox.lock().drain().len();
        let failed = self.pending.fail_all(MeshError::ClientDisconnected(reason.into()));
        tracing::info!(instance = %self.settings.instance, dropped, failed, "client stopped");
    }

    /// Run an incoming call against the local target, inside the caller's
    /// context.
    async fn execute_incoming(&self, chain: Value, call_context: CallContext) -> Result<Value, MeshError> {
        self.settings.policy.check(&self.identity, &call_context)?;
        let target = self.settings.target.clone().ok_or_else(|| {
            MeshError::NotCallable(format!("{} accepts no incoming calls", self.identity))
        })?;
        let chain = OperationChain::from_value(chain)?;
        let options = self.settings.execute;

        let run = context::run_with(call_context, async move {
            execute_operation_chain(&chain, target, &options).await
        });
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(instance = %self.settings.instance, "incoming call handler panicked");
                Err(MeshError::application("Panic", "incoming call handler panicked"))
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a connection that was successfully opened came to an end.
struct SessionEnd {
    close_code: Option<u16>,
}

/// Connect, run, and reconnect with back-off until shut down or out of
/// attempts.
async fn run(shared: Arc<Shared>, shutdown: CancellationToken) -> Result<(), ClientError> {
    let instance = shared.settings.instance.clone();
    let mut schedule = Reconnector::new(shared.settings.reconnect_backoff.clone());
    let mut force_refresh = false;

    let result = loop {
        let outcome = tokio::select! {
            r = connect_and_run(&shared, force_refresh) => r,
            _ = shutdown.cancelled() => {
                tracing::info!(instance = %instance, "shutdown requested");
                break Err(ClientError::Shutdown);
            }
        };

        force_refresh = false;
        match outcome {
            Ok(session) => {
                tracing::info!(instance = %instance, close_code = ?session.close_code, "connection closed");
                schedule.connected();
                if session.close_code == Some(close_code::CREDENTIAL_EXPIRED) {
                    tracing::info!(instance = %instance, "credential expired; refreshing token before reconnect");
                    force_refresh = true;
                    schedule.credential_expired();
                }
            }
            Err(e) => {
                schedule.failed();
                tracing::warn!(instance = %instance, failures = schedule.failures(), error = %e, "connection failed");
            }
        }
        shared.set_state(ClientState::Reconnecting);

        let delay = match schedule.next_attempt() {
            NextAttempt::After(delay) => delay,
            NextAttempt::GiveUp { failures } => {
                tracing::error!(instance = %instance, failures, "max reconnect attempts exhausted");
                break Err(ClientError::ReconnectExhausted(failures));
            }
        };
        tracing::info!(
            instance = %instance,
            delay_ms = delay.as_millis() as u64,
            failures = schedule.failures(),
            "reconnecting"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.wake.notified() => {
                tracing::info!(instance = %instance, "woken; reconnecting now");
                schedule.woken();
            }
            _ = shutdown.cancelled() => break Err(ClientError::Shutdown),
        }
    };

    shared.set_state(ClientState::Disconnected);
    shared.fail_everything("client stopped");
    result
}

/// Single connection lifecycle: connect → connection_status → message loop.
async fn connect_and_run(shared: &Arc<Shared>, force_refresh: bool) -> Result<SessionEnd, ClientError> {
    let settings = &shared.settings;
    let token = settings.tokens.token(force_refresh).await?;
    tracing::info!(url = %settings.gateway_ws_url, instance = %settings.instance, "connecting to gateway");

    let url = build_url(&settings.gateway_ws_url, &settings.instance, &token)?;
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    // ── connection_status always comes first ─────────────────────────
    let subscription_required = tokio::time::timeout(STATUS_TIMEOUT, wait_for_status(&mut stream))
        .await
        .map_err(|_| ClientError::WebSocket("connection_status timeout".into()))??;
    tracing::info!(instance = %settings.instance, subscription_required, "connected to gateway");
    if let Some(callback) = &settings.on_connection_status {
        callback(subscription_required);
    }

    // ── Writer + heartbeat ───────────────────────────────────────────
    let (link, mut link_rx) = mpsc::unbounded_channel::<WsMessage>();
    let _writer = AbortOnDropHandle::new(tokio::spawn(async move {
        while let Some(msg) = link_rx.recv().await {
            let json = match msg.to_text() {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize outbound message");
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    }));
    let _heartbeat = (!settings.heartbeat_interval.is_zero())
        .then(|| AbortOnDropHandle::new(tokio::spawn(heartbeat(link.clone(), settings.heartbeat_interval))));

    shared.set_state(ClientState::Connected);
    let expired = shared.outbox.lock().go_live(link.clone());
    for call_id in expired {
        shared.pending.settle(
            &call_id,
            Err(MeshError::Timeout("call expired in the outbound queue".into())),
        );
    }

    // ── Reader loop ──────────────────────────────────────────────────
    let mut close = None;
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                close = frame.map(|f| u16::from(f.code));
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "websocket read failed");
                break;
            }
        };

        if text.len() > settings.max_message_bytes {
            tracing::warn!(
                bytes = text.len(),
                max = settings.max_message_bytes,
                "inbound message exceeds max_message_bytes, dropping"
            );
            continue;
        }
        match WsMessage::from_text(&text) {
            Ok(msg) => handle_inbound(shared, &link, msg),
            Err(e) => tracing::debug!(error = %e, "failed to parse message"),
        }
    }

    // Calls written to this connection will never be answered on it.
    let owed = shared.outbox.lock().go_offline();
    for call_id in owed {
        shared.pending.settle(
            &call_id,
            Err(MeshError::ClientDisconnected("connection lost before the response arrived".into())),
        );
    }

    Ok(SessionEnd { close_code: close })
}

async fn wait_for_status(
    stream: &mut (impl Stream<Item = Result<Message, tungstenite::Error>> + Unpin),
) -> Result<bool, ClientError> {
    while let Some(frame) = stream.next().await {
        if let Message::Text(text) = frame? {
            match WsMessage::from_text(&text) {
                Ok(WsMessage::ConnectionStatus { subscription_required }) => return Ok(subscription_required),
                Ok(other) => tracing::debug!(
                    msg_type = ?std::mem::discriminant(&other),
                    "message before connection_status"
                ),
                Err(e) => tracing::debug!(error = %e, "failed to parse message"),
            }
        }
    }
    Err(ClientError::WebSocket("connection closed before connection_status".into()))
}

async fn heartbeat(link: LiveLink, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        interval.tick().await;
        let ping = WsMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        };
        if link.send(ping).is_err() {
            break;
        }
    }
}

fn handle_inbound(shared: &Arc<Shared>, link: &LiveLink, msg: WsMessage) {
    match msg {
        WsMessage::CallResponse { call_id, result, error } => {
            shared.outbox.lock().acknowledge(&call_id);
            shared.pending.settle(&call_id, response_outcome(result, error));
        }
        WsMessage::IncomingCall {
            call_id,
            chain,
            call_context,
        } => {
            tracing::debug!(%call_id, caller = ?call_context.caller(), "received incoming_call");
            let shared = shared.clone();
            let link = link.clone();
            tokio::spawn(async move {
                let outcome = shared.execute_incoming(chain, call_context).await;
                if let Err(e) = &outcome {
                    tracing::debug!(%call_id, kind = %e.kind(), error = %e, "incoming call failed");
                }
                let _ = link.send(WsMessage::incoming_call_response(call_id, outcome));
            });
        }
        WsMessage::Ping { timestamp } => {
            let _ = link.send(WsMessage::Pong { timestamp });
        }
        WsMessage::Pong { .. } => {
            tracing::trace!("received pong");
        }
        other => {
            tracing::debug!(msg_type = ?std::mem::discriminant(&other), "ignoring unexpected message");
        }
    }
}

/// Build the full connection URL with identity and auth params.
fn build_url(base: &str, instance: &str, token: &str) -> Result<String, ClientError> {
    let mut url = url::Url::parse(base).map_err(|e| ClientError::Config(format!("gateway url `{base}`: {e}")))?;
    url.query_pairs_mut()
        .append_pair("instance", instance)
        .append_pair("token", token);
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SameClientOnly;
    use crate::types::StaticToken;
    use mc_chain::{args, Continuation, Instance, MethodTable};
    use serde_json::json;

    #[test]
    fn build_url_appends_params() {
        assert_eq!(
            build_url("ws://gw:3210/v1/clients/ws", "ada.phone", "tok").unwrap(),
            "ws://gw:3210/v1/clients/ws?instance=ada.phone&token=tok"
        );
        assert!(build_url("ws://gw/ws?x=1", "ada.phone", "tok")
            .unwrap()
            .starts_with("ws://gw/ws?x=1&instance="));
    }

    #[test]
    fn build_url_encodes_reserved_characters() {
        let built = build_url("ws://gw/ws", "ada phone", "a+b&c=d #x").unwrap();
        let parsed = url::Url::parse(&built).unwrap();
        assert_eq!(parsed.fragment(), None);
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("instance".to_string(), "ada phone".to_string()),
                ("token".to_string(), "a+b&c=d #x".to_string()),
            ]
        );
    }

    #[test]
    fn build_url_rejects_garbage() {
        assert!(matches!(build_url("not a url", "ada.phone", "tok"), Err(ClientError::Config(_))));
    }

    struct Greeter;

    fn shared(target: Option<Arc<dyn Target>>) -> Shared {
        Shared::new(ClientSettings {
            gateway_ws_url: "ws://localhost:3210/v1/clients/ws".into(),
            instance: "ada.phone".into(),
            client_binding: "client".into(),
            tokens: Arc::new(StaticToken("t".into())),
            target,
            policy: Arc::new(SameClientOnly),
            execute: ExecuteOptions::default(),
            reconnect_backoff: ReconnectBackoff::default(),
            heartbeat_interval: Duration::ZERO,
            queue_capacity: 4,
            queue_message_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_secs(1),
            max_message_bytes: 1024,
            on_connection_status: None,
        })
    }

    fn greeter() -> Arc<dyn Target> {
        let mut table = MethodTable::<Greeter>::new();
        table
            .callable("greet", |_, args| async move {
                let caller = context::current_caller().map(|c| c.binding_name);
                Ok(json!({ "hello": args.first().cloned(), "from": caller }))
            })
            .internal("secret", |_, _| async move { Ok(json!("hidden")) });
        Arc::new(Instance::new(Arc::new(Greeter), table))
    }

    fn from_room() -> CallContext {
        CallContext {
            call_chain: vec![NodeIdentity::actor("Room", "r1")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn incoming_call_runs_inside_callers_context() {
        let s = shared(Some(greeter()));
        let chain = Continuation::new().call("greet", args!["ada"]).into_chain().to_value();
        let out = s.execute_incoming(chain, from_room()).await.unwrap();
        assert_eq!(out, json!({ "hello": "ada", "from": "Room" }));
    }

    #[tokio::test]
    async fn incoming_call_respects_callable_policy() {
        let s = shared(Some(greeter()));
        let chain = Continuation::new().call("secret", args![]).into_chain().to_value();
        let err = s.execute_incoming(chain, from_room()).await.unwrap_err();
        assert!(matches!(err, MeshError::NotCallable(_)));
    }

    #[tokio::test]
    async fn peer_client_calls_are_rejected() {
        let s = shared(Some(greeter()));
        let chain = Continuation::new().call("greet", args!["x"]).into_chain().to_value();
        let ctx = CallContext {
            call_chain: vec![NodeIdentity::client("client", "bob.laptop")],
            ..Default::default()
        };
        let err = s.execute_incoming(chain, ctx).await.unwrap_err();
        assert!(matches!(err, MeshError::GuardRejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_calls_get_the_queue_budget() {
        let s = shared(None);
        let chain = Continuation::new().call("ping", args![]).into_chain();
        let message = outgoing("c1", "echo", None, &chain, false);
        let (mut settled, submitted) = s.submit_call("c1", message).unwrap();
        assert!(matches!(submitted, Ok(Submitted::Queued)));

        // Past call_timeout alone, still inside queue timeout + call timeout.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(settled.try_recv().is_err());
        assert_eq!(s.pending.len(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let err = settled.await.unwrap().unwrap_err();
        assert!(matches!(err, MeshError::Timeout(_)), "{err:?}");
    }

    #[tokio::test]
    async fn wake_while_nobody_waits_is_not_remembered() {
        let s = shared(None);
        s.wake();
        let later = tokio::time::timeout(Duration::from_millis(50), s.wake.notified()).await;
        assert!(later.is_err(), "a stale wake cut the next back-off short");

        let waiting = s.wake.notified();
        s.wake();
        tokio::time::timeout(Duration::from_millis(50), waiting)
            .await
            .expect("a waiting loop is woken");
    }

    #[tokio::test]
    async fn no_target_means_not_callable() {
        let s = shared(None);
        let err = s.execute_incoming(json!([]), from_room()).await.unwrap_err();
        assert!(matches!(err, MeshError::NotCallable(_)));
    }
}
