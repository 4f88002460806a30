pub mod clients;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::ws;

/// Build the gateway router.
///
/// Client upgrades authenticate with their own bearer credential, so no
/// route here sits behind an additional middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(clients::health))
        .route("/v1/clients", get(clients::list_clients))
        .route("/v1/clients/ws", get(ws::client_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
