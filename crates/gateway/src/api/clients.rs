//! Client introspection endpoints.

use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// GET /v1/health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "connected_clients": state.hub.connected_count(),
    }))
}

/// GET /v1/clients — every known client slot and its connection state.
pub async fn list_clients(State(state): State<AppState>) -> impl IntoResponse {
    let clients = state.hub.list();
    Json(serde_json::json!({
        "clients": clients,
        "count": clients.len(),
    }))
}
