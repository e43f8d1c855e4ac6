//! Common Test Utilities for Integration Tests
//!
//! Shared helpers used across integration test modules.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use std::net::SocketAddr;
use std::time::Duration;
use tidepool_controller::config::Config;
use tidepool_controller::fleet::WorkerDescriptor;
use tidepool_controller::{AppState, router};
use tower::util::ServiceExt;

pub const TOKEN: &str = "test-token";

/// Three 2 Gbps workers, 3 Gbps target, authenticated WebSocket
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.auth_token = TOKEN.to_string();
    config.throughput.target_gbps = 3.0;
    config.scheduler.min_concurrent = 1;
    config.scheduler.max_concurrent = 3;
    config.scheduler.seed = Some(11);
    config.workers = (1..=3)
        .map(|i| WorkerDescriptor {
            id: format!("w{}", i),
            address: format!("10.0.0.{}", i),
            name: format!("edge-{}", i),
            max_throughput: 2000.0,
            region: None,
        })
        .collect();
    config
}

/// Create a test application router with state
pub fn create_test_app_with_state() -> (Router, AppState) {
    let state = AppState::new(test_config());
    (router(state.clone()), state)
}

/// GET `uri` and decode the body as JSON
pub async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Serve the router on an ephemeral port
pub async fn spawn_server() -> (SocketAddr, AppState) {
    let (app, state) = create_test_app_with_state();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
