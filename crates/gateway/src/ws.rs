//! WebSocket endpoint for client connections.
//!
//! Flow:
//! 1. Client connects to `/v1/clients/ws?instance=<subject>.<suffix>&token=<bearer>`
//!    (or sends the bearer as `Authorization: Bearer ...`)
//! 2. Gateway verifies the credential and the instance's owning subject,
//!    then upgrades
//! 3. Gateway sends `connection_status` before anything else
//! 4. Bidirectional message loop: the client sends `call` and
//!    `incoming_call_response`, the gateway sends `call_response` and
//!    `incoming_call`, both exchange `ping`/`pong`

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use mc_protocol::{close_code, response_outcome, WsMessage};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::auth::{owning_subject, Attachment, VerifiedCredential};
use crate::error::GatewayError;
use crate::slot::{ActiveConnection, ClientSlot, OutboundFrame};
use crate::state::AppState;

const OUTBOUND_BUFFER: usize = 64;
const WRITER_DRAIN: Duration = Duration::from_secs(1);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query params
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Client instance name, `"<subject>.<suffix>"`.
    pub instance: Option<String>,
    /// Bearer credential (browsers cannot set headers on upgrades).
    pub token: Option<String>,
}

fn bearer(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query.token.as_deref().filter(|t| !t.is_empty()) {
        return Some(token.to_owned());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// GET /v1/clients/ws — authenticate, then upgrade to WebSocket.
pub async fn client_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let instance = query
        .instance
        .clone()
        .filter(|i| !i.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("missing `instance` query parameter".into()))?;
    let token = bearer(&query, &headers)
        .ok_or_else(|| GatewayError::Unauthorized("missing bearer credential".into()))?;

    let credential = state.verifier.verify(&token)?;
    if owning_subject(&instance) != Some(credential.subject.as_str()) {
        tracing::warn!(
            instance = %instance,
            subject = %credential.subject,
            "instance claimed by a different subject"
        );
        return Err(GatewayError::Forbidden(format!(
            "instance `{instance}` is not owned by `{}`",
            credential.subject
        )));
    }

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, instance, credential))
        .into_response())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Socket handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_socket(socket: WebSocket, state: AppState, instance: String, credential: VerifiedCredential) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let gateway = &state.config.gateway;

    let conn_id = uuid::Uuid::new_v4().to_string();
    let attachment = Attachment::new(&gateway.client_binding, &instance, credential);

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_BUFFER);
    let (slot, subscription_required) = state.hub.attach(
        &instance,
        ActiveConnection {
            id: conn_id.clone(),
            sink: outbound_tx.clone(),
            attachment: attachment.clone(),
        },
    );

    // 1. connection_status goes out before the writer task starts, so
    //    nothing queued by a waiting mesh call can overtake it.
    let status = WsMessage::ConnectionStatus { subscription_required };
    if send_ws_message(&mut ws_sink, &status).await.is_err() {
        tracing::warn!(instance = %instance, "failed to send connection_status");
        drop(outbound_tx);
        slot.detach(&conn_id);
        return;
    }

    // 2. Writer task: outbound frames plus heartbeat pings.
    let heartbeat = Duration::from_secs(gateway.heartbeat_interval_secs);
    let mut writer = tokio::spawn(async move {
        let mut ping = (!heartbeat.is_zero()).then(|| {
            let mut interval = tokio::time::interval(heartbeat);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        if let Some(interval) = ping.as_mut() {
            interval.tick().await;
        }
        loop {
            let frame = tokio::select! {
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = tick(ping.as_mut()) => OutboundFrame::Message(WsMessage::Ping {
                    timestamp: Utc::now().timestamp_millis(),
                }),
            };
            match frame {
                OutboundFrame::Message(msg) => {
                    if send_ws_message(&mut ws_sink, &msg).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close { code, reason } => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: Cow::Owned(reason),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // 3. Reader loop.
    let max_bytes = gateway.max_message_bytes;
    while let Some(Ok(msg)) = ws_stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::debug!(instance = %instance, "ignoring binary frame");
                continue;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if text.len() > max_bytes {
            tracing::warn!(instance = %instance, bytes = text.len(), limit = max_bytes, "dropping oversized frame");
            continue;
        }
        if attachment.is_expired() {
            tracing::info!(instance = %instance, "credential expired; closing connection");
            slot.close(&conn_id, close_code::CREDENTIAL_EXPIRED, "credential expired");
            break;
        }

        match WsMessage::from_text(&text) {
            Ok(ws_msg) => handle_inbound(&state, &slot, &attachment, &outbound_tx, ws_msg).await,
            Err(e) => tracing::debug!(instance = %instance, error = %e, "ignoring unparseable message"),
        }
    }

    // Cleanup: start the grace period (unless superseded), then let the
    // writer flush whatever is already queued.
    slot.detach(&conn_id);
    drop(outbound_tx);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::info!(instance = %instance, connection = %conn_id, "client socket closed");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolves on the next heartbeat tick, or never when heartbeats are off.
async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn send_ws_message(sink: &mut (impl SinkExt<Message> + Unpin), msg: &WsMessage) -> Result<(), ()> {
    let json = msg.to_text().map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

async fn handle_inbound(
    state: &AppState,
    slot: &Arc<ClientSlot>,
    attachment: &Attachment,
    outbound: &mpsc::Sender<OutboundFrame>,
    msg: WsMessage,
) {
    match msg {
        WsMessage::Call {
            call_id,
            binding,
            instance,
            chain,
            call_context,
            one_way,
        } => {
            let state = state.clone();
            let attachment = attachment.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let outcome = state
                    .hub
                    .relay(
                        &*state.mesh,
                        &attachment,
                        &binding,
                        instance.as_deref(),
                        chain,
                        call_context,
                    )
                    .await;
                if one_way {
                    if let Err(e) = outcome {
                        tracing::debug!(client = %attachment.identity, %binding, error = %e, "one-way call failed");
                    }
                    return;
                }
                let reply = WsMessage::call_response(call_id, outcome);
                let _ = outbound.send(OutboundFrame::Message(reply)).await;
            });
        }
        WsMessage::IncomingCallResponse { call_id, result, error } => {
            if !slot.complete(&call_id, response_outcome(result, error)) {
                tracing::debug!(instance = %slot.instance(), %call_id, "response for unknown or settled call");
            }
        }
        WsMessage::Ping { timestamp } => {
            let _ = outbound
                .send(OutboundFrame::Message(WsMessage::Pong { timestamp }))
                .await;
        }
        WsMessage::Pong { .. } => {}
        other => {
            tracing::debug!(
                instance = %slot.instance(),
                msg_type = ?std::mem::discriminant(&other),
                "unexpected inbound message type"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_prefers_query_then_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));

        let q = WsQuery {
            instance: None,
            token: Some("from-query".into()),
        };
        assert_eq!(bearer(&q, &headers).as_deref(), Some("from-query"));

        let q = WsQuery {
            instance: None,
            token: None,
        };
        assert_eq!(bearer(&q, &headers).as_deref(), Some("from-header"));
        assert_eq!(bearer(&q, &HeaderMap::new()), None);
    }
}
