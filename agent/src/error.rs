use std::path::PathBuf;
use thiserror::Error;
use tidepool_protocol::ErrorCode;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Command {0} is already running")]
    DuplicateCommand(String),

    #[error("Command {0} not found")]
    UnknownCommand(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),
}

impl AgentError {
    /// Code reported to the controller in an `error` message
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::DuplicateCommand(_) => ErrorCode::DuplicateCommand,
            AgentError::UnknownCommand(_) => ErrorCode::UnknownCommand,
            AgentError::Encode(_) => ErrorCode::InvalidMessage,
            _ => ErrorCode::ExecFailed,
        }
    }
}
