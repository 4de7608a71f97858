use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;
use crate::ws;

/// Build the hub router: websocket fan-out plus a health probe.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
