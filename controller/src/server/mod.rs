//! Worker-facing WebSocket server and the shared application state

mod websocket;

pub use websocket::{
    ConnectionInfo, SEND_BUFFER, WorkerConnection, WorkerConnections, WsConfig, run_sweeper,
    ws_handler,
};

use crate::config::Config;
use crate::fleet::Scheduler;
use crate::metrics::MetricsAggregator;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub connections: WorkerConnections,
    pub aggregator: Arc<MetricsAggregator>,
    pub scheduler: Scheduler,
    pub prometheus: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the transport, the aggregator and the scheduler together
    pub fn new(config: Config) -> Self {
        let connections = WorkerConnections::new();
        let aggregator = Arc::new(MetricsAggregator::new(config.metrics.history_capacity));
        let scheduler = Scheduler::new(
            config.scheduler_config(),
            config.workers.clone(),
            Arc::new(connections.clone()),
            aggregator.clone(),
        );

        Self {
            config: Arc::new(config),
            connections,
            aggregator,
            scheduler,
            prometheus: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
