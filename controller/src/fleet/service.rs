//! Collaborators consumed by the scheduler: the worker transport and the metrics source

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tidepool_protocol::{ControllerMessage, LoadCommand, StopCommand};

/// Command issued to one worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    Start(StartCommand),
    /// An empty id stops everything running on the worker
    Stop { command_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartCommand {
    pub command_id: String,
    pub url: String,
    pub duration: Duration,
    pub throughput_mbps: f64,
    pub start_delay: Option<Duration>,
}

impl WorkerCommand {
    pub fn stop_all() -> Self {
        WorkerCommand::Stop {
            command_id: String::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerCommand::Start(_) => "start",
            WorkerCommand::Stop { .. } => "stop",
        }
    }
}

impl From<WorkerCommand> for ControllerMessage {
    fn from(command: WorkerCommand) -> Self {
        match command {
            WorkerCommand::Start(start) => ControllerMessage::LoadCommand(LoadCommand {
                command_id: start.command_id,
                url: start.url,
                duration_secs: start.duration.as_secs(),
                throughput_mbps: start.throughput_mbps,
                start_delay_secs: start.start_delay.map(|d| d.as_secs()),
            }),
            WorkerCommand::Stop { command_id } => {
                ControllerMessage::StopCommand(StopCommand { command_id })
            }
        }
    }
}

/// Command delivery failures. None of them are fatal to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Worker not connected: {0}")]
    NotConnected(String),

    #[error("Send buffer full for worker {0}")]
    SendBufferFull(String),

    #[error("Connection to worker {0} closed")]
    Closed(String),
}

/// Delivers commands to connected workers
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Queue a command for a worker; best effort, never blocks on the network
    async fn send_command(&self, worker_id: &str, command: WorkerCommand)
    -> Result<(), TransportError>;

    /// Point-in-time set of connected worker ids
    async fn connected_worker_ids(&self) -> HashSet<String>;
}

/// Fleet-wide throughput view
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedMetrics {
    /// Sum of every worker's current Mbps
    pub total_mbps: f64,
    /// Mean of the workers' rolling averages
    pub average_mbps: f64,
    /// Workers reporting at least one running command
    pub active_workers: usize,
    pub reporting_workers: usize,
    pub per_worker: HashMap<String, f64>,
}

/// Source of observed throughput
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn aggregated(&self) -> AggregatedMetrics;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_maps_to_load_command() {
        let message: ControllerMessage = WorkerCommand::Start(StartCommand {
            command_id: "c1".to_string(),
            url: "https://example.com/a".to_string(),
            duration: Duration::from_millis(95_900),
            throughput_mbps: 640.0,
            start_delay: None,
        })
        .into();

        match message {
            ControllerMessage::LoadCommand(load) => {
                assert_eq!(load.duration_secs, 95);
                assert_eq!(load.throughput_mbps, 640.0);
                assert!(load.start_delay_secs.is_none());
            }
            other => panic!("expected load command, got {:?}", other),
        }
    }

    #[test]
    fn test_stop_all_keeps_empty_id() {
        let message: ControllerMessage = WorkerCommand::stop_all().into();
        assert_eq!(message, ControllerMessage::StopCommand(StopCommand::all()));
    }
}
