//! Throughput sampling for running jobs

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tidepool_protocol::{CommandMetrics, MetricsReport};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::debug;

/// Byte counter shared between a job and the collector
#[derive(Debug)]
pub struct JobProgress {
    pub command_id: String,
    pub url: String,
    bytes: AtomicU64,
}

impl JobProgress {
    pub fn new(command_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            url: url.into(),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

pub fn bytes_to_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 * 8.0 / 1_000_000.0 / secs
    } else {
        0.0
    }
}

struct TrackedJob {
    progress: Arc<JobProgress>,
    last_bytes: u64,
    current_mbps: f64,
}

#[derive(Default)]
struct CollectorState {
    jobs: HashMap<String, TrackedJob>,
    /// Bytes of jobs that already finished
    finished_bytes: u64,
    current_mbps: f64,
    samples: VecDeque<f64>,
    last_sample: Option<Instant>,
}

/// Samples every job's byte counter and keeps a rolling average of the total
pub struct MetricsCollector {
    window: usize,
    state: Mutex<CollectorState>,
}

impl MetricsCollector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            state: Mutex::new(CollectorState::default()),
        }
    }

    pub async fn register(&self, progress: Arc<JobProgress>) {
        let mut state = self.state.lock().await;
        state.jobs.insert(
            progress.command_id.clone(),
            TrackedJob {
                last_bytes: progress.bytes(),
                progress,
                current_mbps: 0.0,
            },
        );
    }

    pub async fn deregister(&self, command_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.remove(command_id) {
            state.finished_bytes += job.progress.bytes();
        }
    }

    /// Take a sample covering `elapsed` since the previous one
    pub async fn sample(&self, elapsed: Duration) {
        let mut state = self.state.lock().await;
        let mut total = 0.0;
        for job in state.jobs.values_mut() {
            let bytes = job.progress.bytes();
            job.current_mbps = bytes_to_mbps(bytes.saturating_sub(job.last_bytes), elapsed);
            job.last_bytes = bytes;
            total += job.current_mbps;
        }

        state.current_mbps = total;
        state.samples.push_back(total);
        while state.samples.len() > self.window {
            state.samples.pop_front();
        }
    }

    /// Sample using the time since the previous call
    pub async fn sample_now(&self) {
        let now = Instant::now();
        let elapsed = {
            let mut state = self.state.lock().await;
            let elapsed = state.last_sample.map(|t| now - t);
            state.last_sample = Some(now);
            elapsed
        };
        if let Some(elapsed) = elapsed {
            self.sample(elapsed).await;
        }
    }

    /// Payload for a `metrics` message
    pub async fn report(&self) -> MetricsReport {
        let state = self.state.lock().await;
        let average_mbps = if state.samples.is_empty() {
            0.0
        } else {
            state.samples.iter().sum::<f64>() / state.samples.len() as f64
        };

        let mut commands: Vec<CommandMetrics> = state
            .jobs
            .values()
            .map(|job| CommandMetrics {
                command_id: job.progress.command_id.clone(),
                url: job.progress.url.clone(),
                bytes_downloaded: job.progress.bytes(),
                current_mbps: job.current_mbps,
            })
            .collect();
        commands.sort_by(|a, b| a.command_id.cmp(&b.command_id));

        MetricsReport {
            current_mbps: state.current_mbps,
            average_mbps,
            bytes_downloaded: state.finished_bytes
                + commands.iter().map(|c| c.bytes_downloaded).sum::<u64>(),
            active_commands: commands.len(),
            commands,
        }
    }

    /// Sample every `interval` until shutdown
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sample_now().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Metrics sampler stopping");
                        break;
                    }
                }
            }
        }
    }
}
