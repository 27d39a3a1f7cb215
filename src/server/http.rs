//! HTTP surface
//!
//! Liveness endpoints, the `/ws` upgrade route, and per-request access
//! logging.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::server::ws::{ws_handler, WsServerState};

/// Build the gateway router.
pub fn create_router(ws_state: Arc<WsServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(middleware::from_fn(access_log_middleware))
        .with_state(ws_state)
}

/// GET /health, /health/live - liveness probe.
async fn health_handler(State(state): State<Arc<WsServerState>>) -> Response {
    (StatusCode::OK, Json(state.status_snapshot())).into_response()
}

/// Log method, path, status and duration for every request.
pub async fn access_log_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        target: "http",
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}
