use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::connection::run_connection;
use crate::router::GatewayRouter;

/// Shared state accessible by handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub router: GatewayRouter,
    pub client_ping_interval: Duration,
}

/// Build the axum router for the client-facing WS server.
///
/// The router exposes `/ws` (WebSocket upgrade, optionally
/// pre-identified with a `user_id` query parameter) and `/health`.
pub fn build_router(router: GatewayRouter, client_ping_interval: Duration) -> Router {
    let state = AppState {
        router,
        client_ping_interval,
    };
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    user_id: Option<String>,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.router.status())
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    tracing::debug!(user_id = ?query.user_id, "ws upgrade requested");
    let router = state.router.clone();
    let ping_interval = state.client_ping_interval;
    ws.on_upgrade(move |socket| run_connection(socket, query.user_id, router, ping_interval))
}
