//! Fleet data model: worker descriptors, per-worker status, allocations and the fleet state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tidepool_protocol::now_millis;
use tokio::time::Instant;

pub type WorkerId = String;

/// Statically configured worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub id: WorkerId,
    /// Host the worker runs on (informational)
    #[serde(default)]
    pub address: String,
    /// Display name, defaults to the id
    #[serde(default)]
    pub name: String,
    /// Declared capacity in Mbps
    pub max_throughput: f64,
    #[serde(default)]
    pub region: Option<String>,
}

impl WorkerDescriptor {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Selection bookkeeping for one configured worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    pub id: WorkerId,
    /// `None` until the scheduler starts the worker for the first time
    pub last_used: Option<Instant>,
    pub use_count: u64,
    pub region: Option<String>,
}

impl WorkerStatus {
    pub fn new(descriptor: &WorkerDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            last_used: None,
            use_count: 0,
            region: descriptor.region.clone(),
        }
    }
}

/// Rotation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    RampingDown,
    RampingUp,
    Stable,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::RampingDown => "ramping_down",
            Phase::RampingUp => "ramping_up",
            Phase::Stable => "stable",
        }
    }

    /// Numeric form for the phase gauge
    pub fn as_gauge(&self) -> f64 {
        match self {
            Phase::Idle => 0.0,
            Phase::RampingDown => 1.0,
            Phase::RampingUp => 2.0,
            Phase::Stable => 3.0,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Throughput target and command state of one active worker
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub worker_id: WorkerId,
    pub throughput_mbps: f64,
    pub started_at: Instant,
    pub planned_duration: Duration,
    /// Set once the start command has been delivered
    pub command_id: Option<String>,
    pub url: Option<String>,
    /// A start command is scheduled or in flight
    pub start_pending: bool,
}

impl Allocation {
    /// No command delivered and none on the way
    pub fn needs_start(&self) -> bool {
        self.command_id.is_none() && !self.start_pending
    }
}

/// The scheduler's mutable state. Lives behind the scheduler's lock.
#[derive(Debug, Clone)]
pub struct FleetState {
    pub phase: Phase,
    pub allocations: HashMap<WorkerId, Allocation>,
    pub next_rotation: Instant,
    pub target_mbps: f64,
    pub observed_mbps: f64,
    pub last_rotation: Option<Instant>,
    pub rotation_count: u64,
}

impl FleetState {
    pub fn new(target_mbps: f64, now: Instant) -> Self {
        Self {
            phase: Phase::Idle,
            allocations: HashMap::new(),
            next_rotation: now,
            target_mbps,
            observed_mbps: 0.0,
            last_rotation: None,
            rotation_count: 0,
        }
    }

    pub fn allocated_mbps(&self) -> f64 {
        self.allocations.values().map(|a| a.throughput_mbps).sum()
    }

    /// Owned copy for reporting, with instants converted to unix milliseconds
    pub fn snapshot(&self, now: Instant) -> FleetSnapshot {
        let wall = now_millis();

        let mut allocations: Vec<AllocationSnapshot> = self
            .allocations
            .values()
            .map(|a| AllocationSnapshot {
                worker_id: a.worker_id.clone(),
                throughput_mbps: a.throughput_mbps,
                started_at: to_wall_millis(a.started_at, now, wall),
                planned_duration_secs: a.planned_duration.as_secs(),
                command_id: a.command_id.clone(),
                url: a.url.clone(),
            })
            .collect();
        allocations.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        FleetSnapshot {
            phase: self.phase,
            allocations,
            next_rotation: to_wall_millis(self.next_rotation, now, wall),
            seconds_until_rotation: self.next_rotation.saturating_duration_since(now).as_secs(),
            target_mbps: self.target_mbps,
            observed_mbps: self.observed_mbps,
            last_rotation: self.last_rotation.map(|at| to_wall_millis(at, now, wall)),
            rotation_count: self.rotation_count,
        }
    }
}

/// Map a runtime instant onto the wall clock, given a paired reading of both clocks
fn to_wall_millis(at: Instant, now: Instant, wall_now: u64) -> u64 {
    if at >= now {
        wall_now.saturating_add((at - now).as_millis() as u64)
    } else {
        wall_now.saturating_sub((now - at).as_millis() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSnapshot {
    pub worker_id: WorkerId,
    pub throughput_mbps: f64,
    /// Unix milliseconds
    pub started_at: u64,
    pub planned_duration_secs: u64,
    pub command_id: Option<String>,
    pub url: Option<String>,
}

/// Read-only copy of the fleet state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub phase: Phase,
    pub allocations: Vec<AllocationSnapshot>,
    /// Unix milliseconds
    pub next_rotation: u64,
    pub seconds_until_rotation: u64,
    pub target_mbps: f64,
    pub observed_mbps: f64,
    /// Unix milliseconds
    pub last_rotation: Option<u64>,
    pub rotation_count: u64,
}

impl FleetSnapshot {
    pub fn allocated_mbps(&self) -> f64 {
        self.allocations.iter().map(|a| a.throughput_mbps).sum()
    }
}
