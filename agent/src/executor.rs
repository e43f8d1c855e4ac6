//! Load command execution
//!
//! Each `load_command` becomes a job that repeatedly streams its URL, discarding the body and
//! pacing reads to the requested rate, until its duration elapses or it is cancelled.

use crate::error::AgentError;
use crate::metrics::{JobProgress, MetricsCollector};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tidepool_protocol::LoadCommand;
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Wait after a failed request before retrying
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Shortest time between the starts of two requests of one job
const MIN_CYCLE: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to sleep so that `bytes` received over `elapsed` stay at or below `mbps`.
/// A non-positive rate never sleeps.
pub fn pacing_delay(bytes: u64, mbps: f64, elapsed: Duration) -> Duration {
    if !(mbps > 0.0) {
        return Duration::ZERO;
    }
    let bytes_per_sec = mbps * 1_000_000.0 / 8.0;
    let due = Duration::from_secs_f64(bytes as f64 / bytes_per_sec);
    due.saturating_sub(elapsed)
}

struct Job {
    progress: Arc<JobProgress>,
    cancel: watch::Sender<bool>,
}

enum Step {
    Streamed,
    Failed(reqwest::Error),
    Finished,
}

/// Runs and tracks load jobs keyed by command id
#[derive(Clone)]
pub struct Executor {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
    collector: Arc<MetricsCollector>,
    http: reqwest::Client,
}

impl Executor {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            collector,
            http,
        }
    }

    /// Start a job for `command`. A command id that is already running is rejected.
    pub async fn execute(&self, command: LoadCommand) -> Result<(), AgentError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&command.command_id) {
            return Err(AgentError::DuplicateCommand(command.command_id));
        }

        let progress = Arc::new(JobProgress::new(&command.command_id, &command.url));
        let (cancel, cancelled) = watch::channel(false);
        jobs.insert(
            command.command_id.clone(),
            Job {
                progress: progress.clone(),
                cancel,
            },
        );
        drop(jobs);

        self.collector.register(progress.clone()).await;
        info!(
            command_id = %command.command_id,
            url = %command.url,
            throughput_mbps = command.throughput_mbps,
            duration_secs = command.duration_secs,
            start_delay_secs = ?command.start_delay_secs,
            "Starting load command"
        );

        let executor = self.clone();
        tokio::spawn(async move {
            executor.run_job(&command, &progress, cancelled).await;
            executor.finish(&command.command_id, &progress).await;
        });
        Ok(())
    }

    /// Cancel one job, or every job when `command_id` is empty. Returns how many were cancelled.
    pub async fn stop(&self, command_id: &str) -> Result<usize, AgentError> {
        let jobs = self.jobs.read().await;
        if command_id.is_empty() {
            for job in jobs.values() {
                let _ = job.cancel.send(true);
            }
            info!(jobs = jobs.len(), "Stopping all load commands");
            return Ok(jobs.len());
        }

        let job = jobs
            .get(command_id)
            .ok_or_else(|| AgentError::UnknownCommand(command_id.to_string()))?;
        let _ = job.cancel.send(true);
        info!(command_id = %command_id, "Stopping load command");
        Ok(1)
    }

    pub async fn active_command_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn active_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    async fn finish(&self, command_id: &str, progress: &Arc<JobProgress>) {
        let mut jobs = self.jobs.write().await;
        // A newer job may have reused the id after this one was cancelled
        if jobs
            .get(command_id)
            .is_some_and(|job| Arc::ptr_eq(&job.progress, progress))
        {
            jobs.remove(command_id);
        }
        drop(jobs);

        self.collector.deregister(command_id).await;
        info!(
            command_id = %command_id,
            bytes_downloaded = progress.bytes(),
            "Load command finished"
        );
    }

    async fn run_job(
        &self,
        command: &LoadCommand,
        progress: &JobProgress,
        mut cancelled: watch::Receiver<bool>,
    ) {
        if let Some(delay) = command.start_delay_secs.filter(|d| *d > 0) {
            debug!(command_id = %command.command_id, delay_secs = delay, "Delaying start");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                _ = cancelled.wait_for(|c| *c) => return,
            }
        }

        let started = Instant::now();
        let deadline = started + Duration::from_secs(command.duration_secs);
        let base_bytes = progress.bytes();

        loop {
            let cycle_started = Instant::now();
            let step = tokio::select! {
                result = self.stream_once(command, progress, started, base_bytes) => match result {
                    Ok(()) => Step::Streamed,
                    Err(e) => Step::Failed(e),
                },
                _ = tokio::time::sleep_until(deadline) => Step::Finished,
                _ = cancelled.wait_for(|c| *c) => Step::Finished,
            };

            let resume = match step {
                Step::Finished => return,
                Step::Streamed => cycle_started + MIN_CYCLE,
                Step::Failed(e) => {
                    warn!(command_id = %command.command_id, "Request failed, retrying: {}", e);
                    Instant::now() + RETRY_BACKOFF
                }
            };
            let resume = deadline.min(resume);
            if resume > Instant::now() {
                tokio::select! {
                    _ = tokio::time::sleep_until(resume) => {}
                    _ = cancelled.wait_for(|c| *c) => return,
                }
            }
            if Instant::now() >= deadline {
                return;
            }
        }
    }

    /// Download `url` once, throttled against the job-wide byte budget
    async fn stream_once(
        &self,
        command: &LoadCommand,
        progress: &JobProgress,
        started: Instant,
        base_bytes: u64,
    ) -> Result<(), reqwest::Error> {
        let mut response = self
            .http
            .get(&command.url)
            .send()
            .await?
            .error_for_status()?;

        while let Some(chunk) = response.chunk().await? {
            progress.add(chunk.len() as u64);
            let delay = pacing_delay(
                progress.bytes() - base_bytes,
                command.throughput_mbps,
                started.elapsed(),
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }
}
