//! Fleet scheduler
//!
//! Owns the fleet state and drives it through rotations:
//! select → allocate → ramp down → ramp up → commit → reschedule.
//! Between rotations each tick compares observed throughput with the allocations and boosts
//! workers that fall short.

use super::allocator::{Bounds, allocate};
use super::random::{clamp, random_interval, stagger_delays};
use super::registry::WorkerRegistry;
use super::service::{MetricsSource, StartCommand, WorkerCommand, WorkerTransport};
use super::state::{
    Allocation, FleetSnapshot, FleetState, Phase, WorkerDescriptor, WorkerId, WorkerStatus,
};
use super::wave::concurrency_at;
use metrics::{counter, gauge, histogram};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Locator used when no resource URLs are configured
pub const DEFAULT_RESOURCE_URL: &str =
    "https://dl.google.com/linux/direct/google-chrome-stable_current_amd64.deb";

/// Boosts are sized to the shortfall within these bounds (Mbps)
const BOOST_MIN_MBPS: f64 = 100.0;
const BOOST_MAX_MBPS: f64 = 500.0;
/// Shortfall, as a fraction of the allocation, that triggers a boost
const BOOST_SHORTFALL_RATIO: f64 = 0.2;
/// No boosts this close to the next rotation
const BOOST_MIN_REMAINING: Duration = Duration::from_secs(30);

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Aggregate target in Mbps
    pub target_mbps: f64,
    /// Accepted relative shortfall before a worker is considered underperforming
    pub tolerance: f64,
    pub min_concurrent: usize,
    pub max_concurrent: usize,
    pub rotation_interval_min: Duration,
    pub rotation_interval_max: Duration,
    /// Per-worker clamp applied by the allocator
    pub worker_throughput: Bounds,
    pub ramp_up: Duration,
    pub ramp_down: Duration,
    pub timing_randomness: f64,
    pub throughput_randomness: f64,
    pub tick_interval: Duration,
    /// Added to a start command's duration so it outlives the rotation
    pub command_buffer: Duration,
    pub resource_urls: Vec<String>,
    /// Fixed seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target_mbps: 10_000.0,
            tolerance: 0.15,
            min_concurrent: 2,
            max_concurrent: 8,
            rotation_interval_min: Duration::from_secs(30),
            rotation_interval_max: Duration::from_secs(180),
            worker_throughput: Bounds::new(400.0, 1200.0),
            ramp_up: Duration::from_secs(15),
            ramp_down: Duration::from_secs(20),
            timing_randomness: 0.3,
            throughput_randomness: 0.25,
            tick_interval: Duration::from_secs(5),
            command_buffer: Duration::from_secs(60),
            resource_urls: Vec::new(),
            seed: None,
        }
    }
}

/// Supplemental load for an underperforming worker
#[derive(Debug, Clone, PartialEq)]
pub struct Boost {
    pub worker_id: WorkerId,
    pub throughput_mbps: f64,
    pub duration: Duration,
}

/// Decide which workers to boost.
///
/// Only while the fleet is stable and at least 30 s remain before the next rotation. Workers
/// whose start command has not gone out yet, and workers with no observed throughput, are
/// skipped.
pub fn plan_boosts(
    state: &FleetState,
    observed: &HashMap<String, f64>,
    tolerance: f64,
    now: Instant,
) -> Vec<Boost> {
    if state.phase != Phase::Stable {
        return Vec::new();
    }
    let remaining = state.next_rotation.saturating_duration_since(now);
    if remaining < BOOST_MIN_REMAINING {
        return Vec::new();
    }

    let mut boosts: Vec<Boost> = state
        .allocations
        .values()
        .filter(|a| a.command_id.is_some())
        .filter_map(|a| {
            let seen = *observed.get(&a.worker_id)?;
            let target = a.throughput_mbps;
            let shortfall = target - seen;
            if seen < target * (1.0 - tolerance) && shortfall > target * BOOST_SHORTFALL_RATIO {
                Some(Boost {
                    worker_id: a.worker_id.clone(),
                    throughput_mbps: clamp(shortfall, BOOST_MIN_MBPS, BOOST_MAX_MBPS),
                    duration: remaining,
                })
            } else {
                None
            }
        })
        .collect();
    boosts.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    boosts
}

/// Sleep for `delay`; false when shutdown fired first
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.wait_for(|stop| *stop) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn record_state_gauges(state: &FleetState) {
    gauge!("tidepool_fleet_phase").set(state.phase.as_gauge());
    gauge!("tidepool_active_allocations").set(state.allocations.len() as f64);
    gauge!("tidepool_allocated_mbps").set(state.allocated_mbps());
    gauge!("tidepool_target_mbps").set(state.target_mbps);
    gauge!("tidepool_observed_mbps").set(state.observed_mbps);
}

struct SchedulerInner {
    config: SchedulerConfig,
    state: RwLock<FleetState>,
    registry: RwLock<WorkerRegistry>,
    rng: Mutex<StdRng>,
    transport: Arc<dyn WorkerTransport>,
    metrics: Arc<dyn MetricsSource>,
    /// Held for the whole rotation pipeline
    rotation_guard: Arc<Mutex<()>>,
    started_at: Instant,
}

/// Fleet scheduler handle; clones share the same fleet
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        workers: Vec<WorkerDescriptor>,
        transport: Arc<dyn WorkerTransport>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let now = Instant::now();

        Self {
            inner: Arc::new(SchedulerInner {
                state: RwLock::new(FleetState::new(config.target_mbps, now)),
                registry: RwLock::new(WorkerRegistry::new(workers)),
                rng: Mutex::new(rng),
                transport,
                metrics,
                rotation_guard: Arc::new(Mutex::new(())),
                started_at: now,
                config,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Deep copy of the fleet state
    pub async fn snapshot(&self) -> FleetSnapshot {
        self.inner.state.read().await.snapshot(Instant::now())
    }

    /// Configured workers with their usage bookkeeping
    pub async fn workers(&self) -> Vec<(WorkerDescriptor, WorkerStatus)> {
        let registry = self.inner.registry.read().await;
        registry
            .descriptors()
            .iter()
            .map(|d| {
                let status = registry
                    .status(&d.id)
                    .cloned()
                    .unwrap_or_else(|| WorkerStatus::new(d));
                (d.clone(), status)
            })
            .collect()
    }

    /// Run until shutdown: an initial rotation, then a periodic tick. On exit every active
    /// worker is told to stop.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.inner.config.tick_interval.as_secs(),
            target_mbps = self.inner.config.target_mbps,
            "Starting fleet scheduler"
        );

        self.spawn_rotation(shutdown.clone());

        let mut interval = tokio::time::interval(self.inner.config.tick_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick(&shutdown).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Fleet scheduler shutting down");
                        break;
                    }
                }
            }
        }

        self.stop_all().await;
    }

    /// One evaluation: start a rotation when due, otherwise run the adaptive loop
    pub async fn tick(&self, shutdown: &watch::Receiver<bool>) {
        let due = Instant::now() >= self.inner.state.read().await.next_rotation;
        if due {
            if self.spawn_rotation(shutdown.clone()).is_none() {
                debug!("Rotation due but one is already in flight");
            }
            return;
        }
        self.adapt().await;
    }

    /// Spawn a rotation unless one is already running
    pub fn spawn_rotation(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let permit = self.inner.rotation_guard.clone().try_lock_owned().ok()?;
        let this = self.clone();
        Some(tokio::spawn(async move {
            this.run_rotation(shutdown).await;
            drop(permit);
        }))
    }

    /// Run one rotation to completion, waiting for any in-flight rotation first
    pub async fn rotate(&self, shutdown: watch::Receiver<bool>) {
        let _permit = self.inner.rotation_guard.clone().lock_owned().await;
        self.run_rotation(shutdown).await;
    }

    async fn run_rotation(&self, shutdown: watch::Receiver<bool>) {
        let inner = &self.inner;
        let cfg = &inner.config;
        let started = Instant::now();

        let connected = inner.transport.connected_worker_ids().await;
        let active: Vec<WorkerId> = inner
            .state
            .read()
            .await
            .allocations
            .keys()
            .cloned()
            .collect();

        let (desired, plan) = {
            let registry = inner.registry.read().await;
            let mut rng = inner.rng.lock().await;
            let desired = concurrency_at(
                started.saturating_duration_since(inner.started_at),
                cfg.min_concurrent,
                cfg.max_concurrent,
                cfg.timing_randomness,
                &mut *rng,
            );
            let selected = registry.select(
                desired,
                &connected,
                active.iter().map(String::as_str),
                started,
                &mut *rng,
            );
            let values = allocate(
                cfg.target_mbps,
                selected.len(),
                cfg.worker_throughput,
                cfg.throughput_randomness,
                &mut *rng,
            );
            let plan: Vec<(WorkerId, f64)> = selected
                .into_iter()
                .zip(values)
                .map(|(id, mbps)| {
                    let capacity = registry.capacity(&id).unwrap_or(mbps);
                    (id, mbps.min(capacity))
                })
                .collect();
            (desired, plan)
        };

        let (to_stop, to_start, mut next) = {
            let mut state = inner.state.write().await;
            state.phase = Phase::RampingDown;

            let planned: HashSet<&str> = plan.iter().map(|(id, _)| id.as_str()).collect();
            let to_stop: Vec<WorkerId> = state
                .allocations
                .keys()
                .filter(|id| !planned.contains(id.as_str()))
                .cloned()
                .collect();

            let mut to_start = Vec::new();
            let mut next = HashMap::with_capacity(plan.len());
            for (id, mbps) in &plan {
                let allocation = match state.allocations.get(id) {
                    Some(existing) if !existing.needs_start() => existing.clone(),
                    _ => {
                        to_start.push((id.clone(), *mbps));
                        Allocation {
                            worker_id: id.clone(),
                            throughput_mbps: *mbps,
                            started_at: started,
                            planned_duration: Duration::ZERO,
                            command_id: None,
                            url: None,
                            start_pending: true,
                        }
                    }
                };
                next.insert(id.clone(), allocation);
            }

            record_state_gauges(&state);
            (to_stop, to_start, next)
        };

        info!(
            desired,
            connected = connected.len(),
            selected = plan.len(),
            stopping = to_stop.len(),
            starting = to_start.len(),
            "Rotation started"
        );

        // Ramp down
        if !to_stop.is_empty() {
            let delays = stagger_delays(to_stop.len(), cfg.ramp_down, &mut *inner.rng.lock().await);
            for (worker_id, delay) in to_stop.into_iter().zip(delays) {
                let this = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.stop_worker(worker_id, delay, shutdown).await });
            }

            let mut shutdown = shutdown.clone();
            if !sleep_or_shutdown(cfg.ramp_down, &mut shutdown).await {
                info!("Rotation interrupted by shutdown during ramp-down");
                return;
            }
        }

        // Ramp up
        inner.state.write().await.phase = Phase::RampingUp;
        let (delays, interval) = {
            let mut rng = inner.rng.lock().await;
            let delays = stagger_delays(to_start.len(), cfg.ramp_up, &mut *rng);
            let interval = random_interval(
                cfg.rotation_interval_min,
                cfg.rotation_interval_max,
                cfg.timing_randomness,
                &mut *rng,
            );
            (delays, interval)
        };

        // Workers that dropped off during ramp-down do not come back with the commit
        let connected = inner.transport.connected_worker_ids().await;
        next.retain(|id, _| connected.contains(id));

        // Commit and reschedule. Retained workers keep their live entry, which a start
        // finishing during ramp-down may have updated.
        let starting: HashSet<&str> = to_start.iter().map(|(id, _)| id.as_str()).collect();
        let now = Instant::now();
        let rotation = {
            let mut state = inner.state.write().await;
            let committed: HashMap<WorkerId, Allocation> = next
                .into_iter()
                .map(|(id, planned)| {
                    let allocation = match state.allocations.remove(&id) {
                        Some(current) if !starting.contains(id.as_str()) => current,
                        _ => planned,
                    };
                    (id, allocation)
                })
                .collect();
            state.allocations = committed;
            state.last_rotation = Some(now);
            state.rotation_count += 1;
            state.phase = Phase::Stable;
            state.next_rotation = now + interval;
            record_state_gauges(&state);
            state.rotation_count
        };

        for ((worker_id, mbps), delay) in to_start.into_iter().zip(delays) {
            if !connected.contains(&worker_id) {
                continue;
            }
            let this = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { this.start_worker(worker_id, mbps, delay, shutdown).await });
        }

        counter!("tidepool_rotations_total").increment(1);
        histogram!("tidepool_rotation_duration_seconds").record(started.elapsed().as_secs_f64());
        info!(
            rotation,
            next_rotation_secs = interval.as_secs(),
            "Rotation committed"
        );
    }

    /// Build a start command with a fresh id and a randomly drawn resource
    async fn start_command(&self, throughput_mbps: f64, duration: Duration) -> StartCommand {
        let urls = &self.inner.config.resource_urls;
        let url = if urls.is_empty() {
            DEFAULT_RESOURCE_URL.to_string()
        } else {
            let i = self.inner.rng.lock().await.random_range(0..urls.len());
            urls[i].clone()
        };

        StartCommand {
            command_id: Uuid::new_v4().to_string(),
            url,
            duration,
            throughput_mbps,
            start_delay: None,
        }
    }

    async fn start_worker(
        &self,
        worker_id: WorkerId,
        throughput_mbps: f64,
        delay: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if !sleep_or_shutdown(delay, &mut shutdown).await {
            self.clear_pending_start(&worker_id).await;
            return;
        }
        self.deliver_start(&worker_id, throughput_mbps).await;
    }

    /// Send a start sized to the rest of the rotation and record it on the allocation.
    /// On failure the allocation is left without a command so a later tick retries it.
    async fn deliver_start(&self, worker_id: &str, throughput_mbps: f64) -> bool {
        let remaining = self
            .inner
            .state
            .read()
            .await
            .next_rotation
            .saturating_duration_since(Instant::now());
        let duration = remaining + self.inner.config.command_buffer;
        let command = self.start_command(throughput_mbps, duration).await;
        let (command_id, url) = (command.command_id.clone(), command.url.clone());

        match self
            .inner
            .transport
            .send_command(worker_id, WorkerCommand::Start(command))
            .await
        {
            Ok(()) => {
                let now = Instant::now();
                if let Some(allocation) = self.inner.state.write().await.allocations.get_mut(worker_id) {
                    allocation.command_id = Some(command_id.clone());
                    allocation.url = Some(url);
                    allocation.started_at = now;
                    allocation.planned_duration = duration;
                    allocation.start_pending = false;
                }
                self.inner.registry.write().await.record_start(worker_id, now);

                counter!("tidepool_workers_started_total").increment(1);
                info!(
                    worker_id = %worker_id,
                    command_id = %command_id,
                    throughput_mbps,
                    duration_secs = duration.as_secs(),
                    "Started worker"
                );
                true
            }
            Err(e) => {
                self.clear_pending_start(worker_id).await;
                counter!("tidepool_command_failures_total", "kind" => "start").increment(1);
                warn!(worker_id = %worker_id, error = %e, "Failed to start worker");
                false
            }
        }
    }

    async fn clear_pending_start(&self, worker_id: &str) {
        if let Some(allocation) = self.inner.state.write().await.allocations.get_mut(worker_id) {
            allocation.start_pending = false;
        }
    }

    async fn stop_worker(
        &self,
        worker_id: WorkerId,
        delay: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if !sleep_or_shutdown(delay, &mut shutdown).await {
            return;
        }
        self.send_stop(&worker_id).await;
    }

    async fn send_stop(&self, worker_id: &str) {
        match self
            .inner
            .transport
            .send_command(worker_id, WorkerCommand::stop_all())
            .await
        {
            Ok(()) => {
                counter!("tidepool_workers_stopped_total").increment(1);
                info!(worker_id = %worker_id, "Stopped worker");
            }
            Err(e) => {
                counter!("tidepool_command_failures_total", "kind" => "stop").increment(1);
                warn!(worker_id = %worker_id, error = %e, "Failed to stop worker");
            }
        }
    }

    /// Adaptive loop: refresh the observed throughput, retry starts that never went out and
    /// boost underperforming workers. Returns the number of commands delivered.
    pub async fn adapt(&self) -> usize {
        let metrics = self.inner.metrics.aggregated().await;
        let (retries, boosts) = {
            let mut state = self.inner.state.write().await;
            state.observed_mbps = metrics.total_mbps;
            record_state_gauges(&state);
            let boosts = plan_boosts(
                &state,
                &metrics.per_worker,
                self.inner.config.tolerance,
                Instant::now(),
            );

            let mut retries: Vec<(WorkerId, f64)> = Vec::new();
            if state.phase == Phase::Stable {
                for allocation in state.allocations.values_mut() {
                    if allocation.needs_start() {
                        allocation.start_pending = true;
                        retries.push((allocation.worker_id.clone(), allocation.throughput_mbps));
                    }
                }
                retries.sort_by(|a, b| a.0.cmp(&b.0));
            }
            (retries, boosts)
        };

        let mut delivered = 0;
        for (worker_id, throughput_mbps) in retries {
            debug!(worker_id = %worker_id, "Retrying undelivered start");
            if self.deliver_start(&worker_id, throughput_mbps).await {
                delivered += 1;
            }
        }
        for boost in boosts {
            let command = self.start_command(boost.throughput_mbps, boost.duration).await;
            let command_id = command.command_id.clone();
            match self
                .inner
                .transport
                .send_command(&boost.worker_id, WorkerCommand::Start(command))
                .await
            {
                Ok(()) => {
                    delivered += 1;
                    counter!("tidepool_boosts_total").increment(1);
                    info!(
                        worker_id = %boost.worker_id,
                        command_id = %command_id,
                        boost_mbps = boost.throughput_mbps,
                        "Boosted underperforming worker"
                    );
                }
                Err(e) => {
                    counter!("tidepool_command_failures_total", "kind" => "boost").increment(1);
                    warn!(worker_id = %boost.worker_id, error = %e, "Failed to boost worker");
                }
            }
        }
        delivered
    }

    pub async fn on_worker_connected(&self, worker_id: &str) {
        if self.inner.registry.read().await.descriptor(worker_id).is_some() {
            info!(worker_id = %worker_id, "Worker available for scheduling");
        } else {
            warn!(worker_id = %worker_id, "Connected worker is not configured and will not be scheduled");
        }
    }

    /// Drop the worker's allocation. Its registry entry stays.
    pub async fn on_worker_disconnected(&self, worker_id: &str) {
        let mut state = self.inner.state.write().await;
        if state.allocations.remove(worker_id).is_some() {
            record_state_gauges(&state);
            info!(worker_id = %worker_id, "Removed allocation of disconnected worker");
        }
    }

    /// Best-effort stop broadcast to every active worker
    pub async fn stop_all(&self) {
        let active: Vec<WorkerId> = self
            .inner
            .state
            .read()
            .await
            .allocations
            .keys()
            .cloned()
            .collect();
        info!(workers = active.len(), "Stopping all active workers");
        for worker_id in active {
            self.send_stop(&worker_id).await;
        }
    }
}
