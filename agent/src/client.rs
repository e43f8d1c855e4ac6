//! Controller connection: registration, command dispatch, metric reports and reconnects

use crate::config::Config;
use crate::error::AgentError;
use crate::executor::Executor;
use crate::metrics::MetricsCollector;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tidepool_protocol::{ControllerMessage, Envelope, WorkerMessage, WorkerState};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outgoing queue size
const OUTBOX: usize = 256;
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Connection lost; reconnect
    Disconnected,
    /// Controller or local signal asked us to exit
    Shutdown,
}

/// The worker agent
pub struct Agent {
    config: Arc<Config>,
    executor: Executor,
    collector: Arc<MetricsCollector>,
    started_at: Instant,
}

impl Agent {
    pub fn new(config: Config) -> Self {
        let collector = Arc::new(MetricsCollector::new(config.metrics.average_window));
        Self {
            executor: Executor::new(collector.clone()),
            collector,
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Connect, serve, reconnect, until shutdown or the reconnect budget runs out.
    /// Every job is stopped before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        tokio::spawn(
            self.collector
                .clone()
                .run(self.config.sample_interval(), shutdown.clone()),
        );

        let max_attempts = self.config.controller.max_reconnect_attempts;
        let mut attempts = 0u32;
        let result = loop {
            match self.connect().await {
                Ok(socket) => {
                    attempts = 0;
                    info!(url = %self.config.controller.url, "Connected to controller");
                    if self.session(socket, &mut shutdown).await == SessionEnd::Shutdown {
                        break Ok(());
                    }
                    warn!("Lost connection to controller");
                }
                Err(e) => {
                    warn!(attempt = attempts + 1, "Failed to connect to controller: {}", e);
                }
            }

            attempts += 1;
            if max_attempts > 0 && attempts >= max_attempts {
                error!(attempts, "Max reconnection attempts reached, giving up");
                break Err(AgentError::ReconnectExhausted(attempts));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval()) => {}
                _ = shutdown.wait_for(|s| *s) => break Ok(()),
            }
        };

        let _ = self.executor.stop("").await;
        info!("Agent stopped");
        result
    }

    /// Open the socket and register
    async fn connect(&self) -> Result<Socket, AgentError> {
        let mut request = self.config.controller.url.as_str().into_client_request()?;
        if !self.config.controller.auth_token.is_empty() {
            let bearer = format!("Bearer {}", self.config.controller.auth_token);
            let value = HeaderValue::from_str(&bearer)
                .map_err(|e| AgentError::InvalidConfig(format!("auth_token: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (mut socket, _) = tokio_tungstenite::connect_async(request).await?;
        let register = WorkerMessage::Register {
            worker_id: self.config.agent.id.clone(),
            name: self.config.display_name().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec!["http".to_string()],
        };
        socket.send(encode(register)?).await?;
        Ok(socket)
    }

    /// Serve one connection until it drops or shutdown is requested
    async fn session(&self, socket: Socket, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        let (outbox, mut outgoing) = mpsc::channel::<WorkerMessage>(OUTBOX);

        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.tick().await;
            loop {
                let frame = tokio::select! {
                    msg = outgoing.recv() => match msg {
                        Some(msg) => match encode(msg) {
                            Ok(frame) => frame,
                            Err(e) => {
                                error!("Failed to serialize message: {}", e);
                                continue;
                            }
                        },
                        None => break,
                    },
                    _ = ping.tick() => Message::Ping(Vec::new().into()),
                };
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        let reporter_outbox = outbox.clone();
        let collector = self.collector.clone();
        let report_interval = self.config.report_interval();
        let reporter = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(report_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = collector.report().await;
                if let Err(mpsc::error::TrySendError::Closed(_)) =
                    reporter_outbox.try_send(WorkerMessage::Metrics(report))
                {
                    break;
                }
            }
        });

        let _ = outbox.try_send(self.status().await);

        let end = loop {
            let frame = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => break SessionEnd::Shutdown,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    match Envelope::<ControllerMessage>::from_json(&text) {
                        Ok(envelope) => {
                            if let Some(end) = self.handle_message(envelope.message, &outbox).await
                            {
                                break end;
                            }
                        }
                        Err(e) => warn!("Failed to parse controller message: {}", e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break SessionEnd::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    break SessionEnd::Disconnected;
                }
            }
        };

        reporter.abort();
        drop(outbox);
        let _ = writer.await;
        end
    }

    /// Act on one controller message; `Some` ends the session
    pub async fn handle_message(
        &self,
        message: ControllerMessage,
        outbox: &mpsc::Sender<WorkerMessage>,
    ) -> Option<SessionEnd> {
        match message {
            ControllerMessage::LoadCommand(command) => {
                let command_id = command.command_id.clone();
                if let Err(e) = self.executor.execute(command).await {
                    warn!(command_id = %command_id, "Rejected load command: {}", e);
                    send(
                        outbox,
                        WorkerMessage::Error {
                            code: e.code(),
                            message: e.to_string(),
                            details: Some(command_id),
                        },
                    );
                }
            }
            ControllerMessage::StopCommand(stop) => {
                if let Err(e) = self.executor.stop(&stop.command_id).await {
                    debug!("Stop ignored: {}", e);
                }
            }
            ControllerMessage::HealthCheck { request_id } => {
                send(
                    outbox,
                    WorkerMessage::HealthResponse {
                        request_id,
                        status: "healthy".to_string(),
                    },
                );
            }
            ControllerMessage::Shutdown => {
                info!("Controller requested shutdown");
                return Some(SessionEnd::Shutdown);
            }
        }
        None
    }

    /// Current `status` message
    pub async fn status(&self) -> WorkerMessage {
        let active_commands = self.executor.active_command_ids().await;
        WorkerMessage::Status {
            state: if active_commands.is_empty() {
                WorkerState::Idle
            } else {
                WorkerState::Downloading
            },
            active_commands,
            uptime_secs: self.started_at.elapsed().as_secs(),
            last_error: None,
        }
    }
}

fn encode(message: WorkerMessage) -> Result<Message, serde_json::Error> {
    Ok(Message::Text(Envelope::new(message).to_json()?.into()))
}

fn send(outbox: &mpsc::Sender<WorkerMessage>, message: WorkerMessage) {
    if outbox.try_send(message).is_err() {
        warn!("Send buffer full, dropping message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidepool_protocol::{ErrorCode, LoadCommand, StopCommand};

    fn agent() -> Agent {
        let mut config = Config::default();
        config.agent.id = "w1".into();
        Agent::new(config)
    }

    fn load(id: &str) -> ControllerMessage {
        ControllerMessage::LoadCommand(LoadCommand {
            command_id: id.to_string(),
            url: "http://127.0.0.1:9/file".to_string(),
            duration_secs: 60,
            throughput_mbps: 50.0,
            start_delay_secs: Some(3600),
        })
    }

    #[tokio::test]
    async fn test_health_check_is_answered() {
        let agent = agent();
        let (tx, mut rx) = mpsc::channel(4);

        let end = agent
            .handle_message(
                ControllerMessage::HealthCheck {
                    request_id: "r1".into(),
                },
                &tx,
            )
            .await;

        assert_eq!(end, None);
        match rx.try_recv().unwrap() {
            WorkerMessage::HealthResponse { request_id, status } => {
                assert_eq!(request_id, "r1");
                assert_eq!(status, "healthy");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_load_reports_error() {
        let agent = agent();
        let (tx, mut rx) = mpsc::channel(4);

        agent.handle_message(load("c1"), &tx).await;
        agent.handle_message(load("c1"), &tx).await;

        match rx.try_recv().unwrap() {
            WorkerMessage::Error { code, details, .. } => {
                assert_eq!(code, ErrorCode::DuplicateCommand);
                assert_eq!(details.as_deref(), Some("c1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            agent.status().await,
            WorkerMessage::Status { state: WorkerState::Downloading, .. }
        ));
        agent
            .handle_message(ControllerMessage::StopCommand(StopCommand::all()), &tx)
            .await;
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let agent = agent();
        let (tx, _rx) = mpsc::channel(4);

        let end = agent.handle_message(ControllerMessage::Shutdown, &tx).await;

        assert_eq!(end, Some(SessionEnd::Shutdown));
    }

    #[tokio::test]
    async fn test_idle_status() {
        match agent().status().await {
            WorkerMessage::Status {
                state,
                active_commands,
                ..
            } => {
                assert_eq!(state, WorkerState::Idle);
                assert!(active_commands.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
