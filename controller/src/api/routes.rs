//! HTTP route handlers for the reporting API

use crate::fleet::FleetSnapshot;
use crate::metrics::{MetricsSnapshot, ThroughputStats, WorkerMetrics};
use crate::server::AppState;
use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid window '{0}': expected <n>s, <n>m or <n>h")]
    InvalidWindow(String),

    #[error("Prometheus exporter not installed")]
    ExporterUnavailable,
}

/// Error response for the API
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl From<ApiError> for ErrorResponse {
    fn from(e: ApiError) -> Self {
        let code = match &e {
            ApiError::InvalidWindow(_) => "invalid_window",
            ApiError::ExporterUnavailable => "exporter_unavailable",
        };
        Self {
            error: e.to_string(),
            code: code.to_string(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = match self.code.as_str() {
            "invalid_window" => StatusCode::BAD_REQUEST,
            "exporter_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

/// Parse `30s`, `15m`, `2h`. A missing or empty window means one hour.
pub fn parse_window(raw: Option<&str>) -> Result<Duration, ApiError> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(DEFAULT_WINDOW),
        Some(r) => r,
    };
    let invalid = || ApiError::InvalidWindow(raw.to_string());

    let unit_at = raw.len() - raw.chars().last().map_or(0, char::len_utf8);
    let (digits, unit) = raw.split_at(unit_at);
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(invalid());
    }
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(secs))
}

fn percent_of(value: f64, target: f64) -> f64 {
    if target > 0.0 { value / target * 100.0 } else { 0.0 }
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub window: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connected_workers: usize,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_secs(),
        connected_workers: state.connections.len().await,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub fleet: FleetSnapshot,
    /// Live sum of the workers' reports
    pub current_mbps: f64,
    pub percent_of_target: f64,
}

/// GET /status - fleet snapshot plus live throughput
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let fleet = state.scheduler.snapshot().await;
    let current_mbps = state.aggregator.aggregate().total_mbps;
    Json(StatusResponse {
        percent_of_target: percent_of(current_mbps, fleet.target_mbps),
        current_mbps,
        fleet,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerView {
    pub id: String,
    pub name: String,
    pub address: String,
    pub max_throughput: f64,
    pub region: Option<String>,
    pub connected: bool,
    pub last_seen_secs: Option<u64>,
    pub current_mbps: f64,
    pub average_mbps: f64,
    pub allocated_mbps: Option<f64>,
    pub use_count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkersResponse {
    pub workers: Vec<WorkerView>,
    pub total: usize,
    pub connected: usize,
    pub active: usize,
}

/// GET /workers - every configured worker
pub async fn workers(State(state): State<AppState>) -> Json<WorkersResponse> {
    let connections: HashMap<String, u64> = state
        .connections
        .list()
        .await
        .into_iter()
        .map(|c| (c.worker_id, c.last_seen_secs))
        .collect();
    let allocations: HashMap<String, f64> = state
        .scheduler
        .snapshot()
        .await
        .allocations
        .into_iter()
        .map(|a| (a.worker_id, a.throughput_mbps))
        .collect();

    let workers: Vec<WorkerView> = state
        .scheduler
        .workers()
        .await
        .into_iter()
        .map(|(descriptor, status)| {
            let reported = state.aggregator.worker(&descriptor.id);
            WorkerView {
                name: descriptor.display_name().to_string(),
                connected: connections.contains_key(&descriptor.id),
                last_seen_secs: connections.get(&descriptor.id).copied(),
                current_mbps: reported.as_ref().map_or(0.0, |m| m.current_mbps),
                average_mbps: reported.as_ref().map_or(0.0, |m| m.average_mbps),
                allocated_mbps: allocations.get(&descriptor.id).copied(),
                use_count: status.use_count,
                id: descriptor.id,
                address: descriptor.address,
                max_throughput: descriptor.max_throughput,
                region: descriptor.region,
            }
        })
        .collect();

    Json(WorkersResponse {
        total: workers.len(),
        connected: workers.iter().filter(|w| w.connected).count(),
        active: workers.iter().filter(|w| w.allocated_mbps.is_some()).count(),
        workers,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub total_mbps: f64,
    pub total_gbps: f64,
    pub average_mbps: f64,
    pub active_workers: usize,
    pub reporting_workers: usize,
    pub target_gbps: f64,
    pub percent_of_target: f64,
    pub workers: Vec<WorkerMetrics>,
}

/// GET /metrics - current aggregate
pub async fn current_metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    let aggregate = state.aggregator.aggregate();
    let target_mbps = state.config.target_mbps();
    Json(MetricsResponse {
        total_mbps: aggregate.total_mbps,
        total_gbps: aggregate.total_mbps / 1000.0,
        average_mbps: aggregate.average_mbps,
        active_workers: aggregate.active_workers,
        reporting_workers: aggregate.reporting_workers,
        target_gbps: state.config.throughput.target_gbps,
        percent_of_target: percent_of(aggregate.total_mbps, target_mbps),
        workers: state.aggregator.workers(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub window_secs: u64,
    pub snapshots: Vec<MetricsSnapshot>,
}

/// GET /history?window=1h
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<HistoryResponse>, ErrorResponse> {
    let window = parse_window(query.window.as_deref())?;
    Ok(Json(HistoryResponse {
        window_secs: window.as_secs(),
        snapshots: state.aggregator.history(window).await,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub window_secs: u64,
    pub target_mbps: f64,
    /// `None` when the window holds no snapshots
    pub stats: Option<ThroughputStats>,
    pub average_percent_of_target: Option<f64>,
}

/// GET /stats?window=1h
pub async fn stats(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<StatsResponse>, ErrorResponse> {
    let window = parse_window(query.window.as_deref())?;
    let target_mbps = state.config.target_mbps();
    let stats = state.aggregator.stats(window).await;
    Ok(Json(StatsResponse {
        window_secs: window.as_secs(),
        target_mbps,
        average_percent_of_target: stats
            .as_ref()
            .map(|s| percent_of(s.average_mbps, target_mbps)),
        stats,
    }))
}

/// GET /metrics/prometheus
pub async fn prometheus_metrics(State(state): State<AppState>) -> Result<Response, ErrorResponse> {
    let handle = state
        .prometheus
        .as_ref()
        .ok_or(ApiError::ExporterUnavailable)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}
