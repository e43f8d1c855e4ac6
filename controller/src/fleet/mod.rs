//! Fleet core
//!
//! This module provides:
//! - randomized helpers and the concurrency wave
//! - the bandwidth allocator
//! - the worker registry and weighted selection
//! - the `Scheduler` state machine with its adaptive boost loop
//! - `WorkerTransport` / `MetricsSource`, the collaborators the scheduler drives

pub mod allocator;
pub mod random;
pub mod registry;
pub mod scheduler;
mod service;
mod state;
pub mod wave;

pub use allocator::{Bounds, allocate};
pub use registry::WorkerRegistry;
pub use scheduler::{Boost, DEFAULT_RESOURCE_URL, Scheduler, SchedulerConfig, plan_boosts};
pub use service::{
    AggregatedMetrics, MetricsSource, StartCommand, TransportError, WorkerCommand,
    WorkerTransport,
};
pub use state::{
    Allocation, AllocationSnapshot, FleetSnapshot, FleetState, Phase, WorkerDescriptor, WorkerId,
    WorkerStatus,
};
