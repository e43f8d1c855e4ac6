use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Controller to worker messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMessage {
    /// Generate load against `url` at `throughput_mbps` for `duration_secs`
    LoadCommand(LoadCommand),
    /// Stop one command, or every command when `command_id` is empty
    StopCommand(StopCommand),
    /// Keepalive check; the worker answers with `health_response`
    HealthCheck { request_id: String },
    /// Ask the worker process to exit
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadCommand {
    pub command_id: String,
    pub url: String,
    pub duration_secs: u64,
    pub throughput_mbps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopCommand {
    /// Empty means "stop everything running on this worker"
    #[serde(default)]
    pub command_id: String,
}

impl StopCommand {
    pub fn all() -> Self {
        Self {
            command_id: String::new(),
        }
    }

    pub fn is_stop_all(&self) -> bool {
        self.command_id.is_empty()
    }
}

/// Worker to controller messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// First message on every connection
    Register {
        worker_id: String,
        name: String,
        version: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    /// Periodic throughput report
    Metrics(MetricsReport),
    /// Answer to a `health_check`
    HealthResponse { request_id: String, status: String },
    /// Worker state summary
    Status {
        state: WorkerState,
        active_commands: Vec<String>,
        uptime_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
    /// Worker-side failure
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub current_mbps: f64,
    pub average_mbps: f64,
    pub bytes_downloaded: u64,
    pub active_commands: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMetrics {
    pub command_id: String,
    pub url: String,
    pub bytes_downloaded: u64,
    pub current_mbps: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Downloading,
    Stopping,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ExecFailed,
    DuplicateCommand,
    UnknownCommand,
    InvalidMessage,
}

/// Every frame on the wire: the message plus the sender's clock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Unix time in milliseconds
    pub timestamp: u64,
    #[serde(flatten)]
    pub message: T,
}

impl<T> Envelope<T> {
    pub fn new(message: T) -> Self {
        Self {
            timestamp: now_millis(),
            message,
        }
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Get current timestamp in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
