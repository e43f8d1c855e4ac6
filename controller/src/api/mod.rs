//! Read-only reporting API
//!
//! Served on the same listener as the worker WebSocket endpoint.

pub mod routes;

pub use routes::{ApiError, ErrorResponse, parse_window};

use crate::server::{AppState, ws_handler};
use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the full router: reporting routes plus `/ws`
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health))
        .route("/status", get(routes::status))
        .route("/workers", get(routes::workers))
        .route("/metrics", get(routes::current_metrics))
        .route("/metrics/prometheus", get(routes::prometheus_metrics))
        .route("/history", get(routes::history))
        .route("/stats", get(routes::stats))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
