//! Test Utilities Module
//!
//! Recording transport, scripted metrics source and configuration fixtures.
//! This module is only compiled when running tests.

#![cfg(test)]

use crate::config::Config;
use crate::fleet::{
    AggregatedMetrics, MetricsSource, SchedulerConfig, StartCommand, TransportError,
    WorkerCommand, WorkerDescriptor, WorkerTransport,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

// ============================================================================
// Fixtures
// ============================================================================

pub fn worker(id: &str, max_throughput: f64, region: Option<&str>) -> WorkerDescriptor {
    WorkerDescriptor {
        id: id.to_string(),
        address: format!("10.0.0.{}", id.trim_start_matches('w')),
        name: String::new(),
        max_throughput,
        region: region.map(str::to_string),
    }
}

/// `w1..=wN`, all with the same capacity and no region
pub fn workers(n: usize, max_throughput: f64) -> Vec<WorkerDescriptor> {
    (1..=n)
        .map(|i| worker(&format!("w{}", i), max_throughput, None))
        .collect()
}

/// Seeded scheduler tuning with a 3 Gbps target
pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        target_mbps: 3000.0,
        min_concurrent: 2,
        max_concurrent: 4,
        ramp_up: Duration::from_secs(15),
        ramp_down: Duration::from_secs(20),
        seed: Some(42),
        ..SchedulerConfig::default()
    }
}

/// Controller configuration with three named workers
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.throughput.target_gbps = 3.0;
    config.scheduler.min_concurrent = 1;
    config.scheduler.max_concurrent = 3;
    config.scheduler.seed = Some(7);
    config.workers = (1..=3)
        .map(|i| WorkerDescriptor {
            name: format!("edge-{}", i),
            ..worker(&format!("w{}", i), 2000.0, Some("eu"))
        })
        .collect();
    config
}

// ============================================================================
// Mock collaborators
// ============================================================================

/// Records every command; fails for workers outside the connected set
#[derive(Default)]
pub struct MockTransport {
    connected: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, WorkerCommand)>>,
    fail: Mutex<bool>,
}

impl MockTransport {
    pub fn with_connected(ids: &[&str]) -> Self {
        let transport = Self::default();
        transport.set_connected(ids);
        transport
    }

    pub fn set_connected(&self, ids: &[&str]) {
        *self.connected.lock().unwrap() = ids.iter().map(|s| s.to_string()).collect();
    }

    pub fn connect(&self, id: &str) {
        self.connected.lock().unwrap().insert(id.to_string());
    }

    pub fn disconnect(&self, id: &str) {
        self.connected.lock().unwrap().remove(id);
    }

    pub fn fail_sends(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn sent(&self) -> Vec<(String, WorkerCommand)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn starts(&self) -> Vec<(String, StartCommand)> {
        self.sent()
            .into_iter()
            .filter_map(|(id, cmd)| match cmd {
                WorkerCommand::Start(start) => Some((id, start)),
                WorkerCommand::Stop { .. } => None,
            })
            .collect()
    }

    /// Worker ids that were sent a stop
    pub fn stops(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(_, cmd)| matches!(cmd, WorkerCommand::Stop { .. }))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl WorkerTransport for MockTransport {
    async fn send_command(
        &self,
        worker_id: &str,
        command: WorkerCommand,
    ) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((worker_id.to_string(), command));

        if *self.fail.lock().unwrap() || !self.connected.lock().unwrap().contains(worker_id) {
            return Err(TransportError::NotConnected(worker_id.to_string()));
        }
        Ok(())
    }

    async fn connected_worker_ids(&self) -> HashSet<String> {
        self.connected.lock().unwrap().clone()
    }
}

/// Metrics source whose per-worker throughput is set by the test
#[derive(Default)]
pub struct ScriptedMetrics {
    metrics: Mutex<AggregatedMetrics>,
}

impl ScriptedMetrics {
    pub fn set_worker(&self, id: &str, mbps: f64) {
        let mut metrics = self.metrics.lock().unwrap();
        metrics.per_worker.insert(id.to_string(), mbps);
        metrics.total_mbps = metrics.per_worker.values().sum();
        metrics.reporting_workers = metrics.per_worker.len();
    }
}

#[async_trait]
impl MetricsSource for ScriptedMetrics {
    async fn aggregated(&self) -> AggregatedMetrics {
        self.metrics.lock().unwrap().clone()
    }
}
