//! Tidepool Agent Library
//!
//! Worker side of the fleet: holds a WebSocket session to the controller, runs the load
//! commands it receives and reports observed throughput back.

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;

pub use client::{Agent, SessionEnd};
pub use config::Config;
pub use error::AgentError;
pub use executor::Executor;
pub use metrics::MetricsCollector;
