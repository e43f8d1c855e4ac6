//! Agent configuration
//!
//! Loaded from YAML, then overridden by `AGENT_ID`, `CONTROLLER_URL`, `AUTH_TOKEN` and
//! `LOG_LEVEL`, then validated.

use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentIdentity,
    pub controller: ControllerConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentIdentity {
    /// Must match a worker id in the controller's configuration
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// WebSocket endpoint, e.g. `ws://controller:8080/ws`
    pub url: String,
    pub auth_token: String,
    pub reconnect_interval_secs: u64,
    /// 0 retries forever
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub report_interval_secs: u64,
    pub sample_interval_secs: u64,
    /// Samples in the rolling average
    pub average_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            auth_token: String::new(),
            reconnect_interval_secs: 5,
            max_reconnect_attempts: 0,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 5,
            sample_interval_secs: 1,
            average_window: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| AgentError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_yaml(&text)?;
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, AgentError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("AGENT_ID") {
            self.agent.id = id;
        }
        if let Some(url) = lookup("CONTROLLER_URL") {
            self.controller.url = url;
        }
        if let Some(token) = lookup("AUTH_TOKEN") {
            self.controller.auth_token = token;
        }
        if let Some(level) = lookup("LOG_LEVEL")
            && !level.is_empty()
        {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        let invalid = |msg: &str| Err(AgentError::InvalidConfig(msg.to_string()));

        if self.agent.id.trim().is_empty() {
            return invalid("agent.id is required");
        }
        if !(self.controller.url.starts_with("ws://") || self.controller.url.starts_with("wss://"))
        {
            return invalid("controller.url must be a ws:// or wss:// URL");
        }
        if self.controller.reconnect_interval_secs == 0 {
            return invalid("controller.reconnect_interval_secs must be positive");
        }
        if self.metrics.report_interval_secs == 0 || self.metrics.sample_interval_secs == 0 {
            return invalid("metrics intervals must be positive");
        }
        if self.metrics.average_window == 0 {
            return invalid("metrics.average_window must be positive");
        }
        Ok(())
    }

    /// Name sent at registration; falls back to the id
    pub fn display_name(&self) -> &str {
        if self.agent.name.is_empty() {
            &self.agent.id
        } else {
            &self.agent.name
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.controller.reconnect_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.metrics.report_interval_secs)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.metrics.sample_interval_secs)
    }
}
