//! Tidepool Controller Library
//!
//! Schedules a fleet of load-generating workers toward an aggregate throughput target.
//! Exported for the binary, integration tests and benchmarks.

pub mod api;
pub mod config;
pub mod dashboard;
pub mod fleet;
pub mod metrics;
pub mod server;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use api::router;
pub use config::{Config, ConfigError};
pub use fleet::{Scheduler, SchedulerConfig};
pub use server::AppState;
