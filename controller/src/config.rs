//! Controller configuration
//!
//! Loaded from a YAML file, then overridden from environment variables, then validated.
//! See `config/controller.yaml` for a documented example.

use crate::fleet::{Bounds, SchedulerConfig, WorkerDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub throughput: ThroughputConfig,
    pub scheduler: SchedulerSettings,
    pub workers: Vec<WorkerDescriptor>,
    /// Pool of URLs the workers download from
    pub resource_urls: Vec<String>,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token workers must present; empty disables the check
    pub auth_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThroughputConfig {
    /// Aggregate target in Gbps
    pub target_gbps: f64,
    /// Relative shortfall tolerated before boosting
    pub tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub min_concurrent: usize,
    pub max_concurrent: usize,
    pub rotation_interval_min_secs: u64,
    pub rotation_interval_max_secs: u64,
    /// Per-worker lower clamp in Mbps
    pub worker_throughput_min: f64,
    /// Per-worker upper clamp in Mbps
    pub worker_throughput_max: f64,
    pub ramp_up_secs: u64,
    pub ramp_down_secs: u64,
    pub timing_randomness: f64,
    pub throughput_randomness: f64,
    pub tick_interval_secs: u64,
    pub command_buffer_secs: u64,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub snapshot_interval_secs: u64,
    /// Snapshots kept in memory (1440 = 24h at one per minute)
    pub history_capacity: usize,
    /// Workers silent for longer than this are disconnected
    pub stale_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            auth_token: String::new(),
        }
    }
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            target_gbps: 10.0,
            tolerance: 0.15,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_concurrent: 2,
            max_concurrent: 8,
            rotation_interval_min_secs: 30,
            rotation_interval_max_secs: 180,
            worker_throughput_min: 400.0,
            worker_throughput_max: 1200.0,
            ramp_up_secs: 15,
            ramp_down_secs: 20,
            timing_randomness: 0.3,
            throughput_randomness: 0.25,
            tick_interval_secs: 5,
            command_buffer_secs: 60,
            seed: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 60,
            history_capacity: 1440,
            stale_after_secs: 120,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Read, override from the environment and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_yaml(&text)?;
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply `HOST`, `PORT`, `AUTH_TOKEN`, `TARGET_GBPS`, `SCHEDULER_SEED`, `LOG_LEVEL` and
    /// `LOG_FORMAT` as returned by `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT")
            && let Ok(p) = port.parse()
        {
            self.server.port = p;
        }
        if let Some(token) = lookup("AUTH_TOKEN") {
            self.server.auth_token = token;
        }
        if let Some(val) = lookup("TARGET_GBPS")
            && let Ok(gbps) = val.parse()
        {
            self.throughput.target_gbps = gbps;
        }
        if let Some(val) = lookup("SCHEDULER_SEED")
            && let Ok(seed) = val.parse()
        {
            self.scheduler.seed = Some(seed);
        }
        if let Some(level) = lookup("LOG_LEVEL")
            && !level.is_empty()
        {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            match format.to_lowercase().as_str() {
                "json" => self.logging.format = LogFormat::Json,
                "text" => self.logging.format = LogFormat::Text,
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let s = &self.scheduler;

        if self.workers.is_empty() {
            return invalid("at least one worker must be configured".into());
        }
        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.id.is_empty() {
                return invalid("worker id must not be empty".into());
            }
            if !seen.insert(worker.id.as_str()) {
                return invalid(format!("duplicate worker id: {}", worker.id));
            }
            if !(worker.max_throughput > 0.0) {
                return invalid(format!(
                    "worker {} max_throughput must be positive",
                    worker.id
                ));
            }
        }
        if s.min_concurrent > s.max_concurrent {
            return invalid(format!(
                "min_concurrent ({}) exceeds max_concurrent ({})",
                s.min_concurrent, s.max_concurrent
            ));
        }
        if s.min_concurrent > self.workers.len() {
            return invalid(format!(
                "min_concurrent ({}) exceeds configured workers ({})",
                s.min_concurrent,
                self.workers.len()
            ));
        }
        if s.rotation_interval_min_secs > s.rotation_interval_max_secs {
            return invalid("rotation_interval_min_secs exceeds rotation_interval_max_secs".into());
        }
        if s.worker_throughput_min > s.worker_throughput_max {
            return invalid("worker_throughput_min exceeds worker_throughput_max".into());
        }
        if !(0.0..1.0).contains(&self.throughput.tolerance) {
            return invalid(format!(
                "tolerance must be in [0, 1), got {}",
                self.throughput.tolerance
            ));
        }
        if !(self.throughput.target_gbps > 0.0) {
            return invalid("target_gbps must be positive".into());
        }
        if s.tick_interval_secs == 0 {
            return invalid("tick_interval_secs must be positive".into());
        }
        if self.metrics.snapshot_interval_secs == 0 {
            return invalid("metrics.snapshot_interval_secs must be positive".into());
        }
        if self.metrics.stale_after_secs == 0 {
            return invalid("metrics.stale_after_secs must be positive".into());
        }
        Ok(())
    }

    pub fn target_mbps(&self) -> f64 {
        self.throughput.target_gbps * 1000.0
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Scheduler tuning derived from this configuration
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            target_mbps: self.target_mbps(),
            tolerance: self.throughput.tolerance,
            min_concurrent: s.min_concurrent,
            max_concurrent: s.max_concurrent,
            rotation_interval_min: Duration::from_secs(s.rotation_interval_min_secs),
            rotation_interval_max: Duration::from_secs(s.rotation_interval_max_secs),
            worker_throughput: Bounds::new(s.worker_throughput_min, s.worker_throughput_max),
            ramp_up: Duration::from_secs(s.ramp_up_secs),
            ramp_down: Duration::from_secs(s.ramp_down_secs),
            timing_randomness: s.timing_randomness,
            throughput_randomness: s.throughput_randomness,
            tick_interval: Duration::from_secs(s.tick_interval_secs),
            command_buffer: Duration::from_secs(s.command_buffer_secs),
            resource_urls: self.resource_urls.clone(),
            seed: s.seed,
        }
    }
}
