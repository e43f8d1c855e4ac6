//! Per-worker throughput reports and the rolling fleet history

use crate::fleet::{AggregatedMetrics, MetricsSource};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tidepool_protocol::{CommandMetrics, MetricsReport, now_millis};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

/// Latest report from one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub worker_id: String,
    pub current_mbps: f64,
    pub average_mbps: f64,
    pub bytes_downloaded: u64,
    pub active_commands: usize,
    pub commands: Vec<CommandMetrics>,
    /// Unix milliseconds
    pub updated_at: u64,
}

/// Fleet aggregate at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Unix milliseconds
    pub timestamp: u64,
    pub total_mbps: f64,
    pub average_mbps: f64,
    pub active_workers: usize,
    pub reporting_workers: usize,
}

/// Summary of the snapshots in a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputStats {
    pub window_secs: u64,
    pub samples: usize,
    pub average_mbps: f64,
    pub min_mbps: f64,
    pub max_mbps: f64,
    /// Sample standard deviation
    pub std_dev_mbps: f64,
}

pub struct MetricsAggregator {
    workers: DashMap<String, WorkerMetrics>,
    history: RwLock<VecDeque<MetricsSnapshot>>,
    capacity: usize,
}

impl MetricsAggregator {
    pub fn new(capacity: usize) -> Self {
        Self {
            workers: DashMap::new(),
            history: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    /// Store the latest report of a worker
    pub fn update(&self, worker_id: &str, report: MetricsReport) {
        debug!(
            worker_id = %worker_id,
            current_mbps = report.current_mbps,
            active_commands = report.active_commands,
            "Metrics report"
        );
        self.workers.insert(
            worker_id.to_string(),
            WorkerMetrics {
                worker_id: worker_id.to_string(),
                current_mbps: report.current_mbps,
                average_mbps: report.average_mbps,
                bytes_downloaded: report.bytes_downloaded,
                active_commands: report.active_commands,
                commands: report.commands,
                updated_at: now_millis(),
            },
        );
    }

    pub fn remove_worker(&self, worker_id: &str) {
        self.workers.remove(worker_id);
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerMetrics> {
        self.workers.get(worker_id).map(|entry| entry.value().clone())
    }

    /// Latest reports, sorted by worker id
    pub fn workers(&self) -> Vec<WorkerMetrics> {
        let mut all: Vec<WorkerMetrics> = self.workers.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        all
    }

    pub fn aggregate(&self) -> AggregatedMetrics {
        let mut metrics = AggregatedMetrics::default();
        let mut average_sum = 0.0;

        for entry in self.workers.iter() {
            let worker = entry.value();
            metrics.total_mbps += worker.current_mbps;
            average_sum += worker.average_mbps;
            metrics.reporting_workers += 1;
            if worker.active_commands > 0 {
                metrics.active_workers += 1;
            }
            metrics
                .per_worker
                .insert(worker.worker_id.clone(), worker.current_mbps);
        }

        if metrics.reporting_workers > 0 {
            metrics.average_mbps = average_sum / metrics.reporting_workers as f64;
        }
        metrics
    }

    /// Append the current aggregate to the history
    pub async fn record_snapshot(&self) -> MetricsSnapshot {
        let aggregate = self.aggregate();
        let snapshot = MetricsSnapshot {
            timestamp: now_millis(),
            total_mbps: aggregate.total_mbps,
            average_mbps: aggregate.average_mbps,
            active_workers: aggregate.active_workers,
            reporting_workers: aggregate.reporting_workers,
        };
        self.push_snapshot(snapshot.clone()).await;
        snapshot
    }

    /// Append a snapshot, evicting the oldest beyond capacity
    pub async fn push_snapshot(&self, snapshot: MetricsSnapshot) {
        let mut history = self.history.write().await;
        history.push_back(snapshot);
        while history.len() > self.capacity {
            history.pop_front();
        }
    }

    /// Snapshots newer than `now − window`, oldest first
    pub async fn history(&self, window: Duration) -> Vec<MetricsSnapshot> {
        let cutoff = now_millis().saturating_sub(window.as_millis() as u64);
        self.history
            .read()
            .await
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub async fn stats(&self, window: Duration) -> Option<ThroughputStats> {
        let samples: Vec<f64> = self
            .history(window)
            .await
            .iter()
            .map(|s| s.total_mbps)
            .collect();
        if samples.is_empty() {
            return None;
        }

        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = if samples.len() > 1 {
            samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };

        Some(ThroughputStats {
            window_secs: window.as_secs(),
            samples: samples.len(),
            average_mbps: mean,
            min_mbps: samples.iter().cloned().fold(f64::INFINITY, f64::min),
            max_mbps: samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            std_dev_mbps: variance.sqrt(),
        })
    }

    /// Record a snapshot every `interval` until shutdown
    pub async fn run_snapshots(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.record_snapshot().await;
                    metrics::gauge!("tidepool_reporting_workers").set(snapshot.reporting_workers as f64);
                    debug!(total_mbps = snapshot.total_mbps, "Recorded metrics snapshot");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Metrics snapshot task shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MetricsSource for MetricsAggregator {
    async fn aggregated(&self) -> AggregatedMetrics {
        self.aggregate()
    }
}
