//! Throughput metrics reported by workers

mod aggregator;

pub use aggregator::{MetricsAggregator, MetricsSnapshot, ThroughputStats, WorkerMetrics};
