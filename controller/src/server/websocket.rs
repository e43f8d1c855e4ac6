use super::AppState;
use crate::fleet::{TransportError, WorkerCommand, WorkerTransport};
use async_trait::async_trait;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tidepool_protocol::{ControllerMessage, Envelope, WorkerMessage, now_millis};
use tokio::sync::{Notify, RwLock, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outgoing queue per worker
pub const SEND_BUFFER: usize = 256;
/// How often `flush` re-checks the outgoing queues
const FLUSH_POLL: Duration = Duration::from_millis(50);

/// Configuration for worker connections
pub struct WsConfig {
    pub health_check_interval: Duration,
    pub register_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            register_timeout: Duration::from_secs(10),
        }
    }
}

/// One registered worker connection
pub struct WorkerConnection {
    /// Distinguishes a reconnect from the connection it replaced
    pub id: Uuid,
    pub worker_id: String,
    pub name: String,
    pub version: String,
    /// Unix milliseconds
    pub connected_at: u64,
    pub last_seen: Instant,
    pub sender: mpsc::Sender<ControllerMessage>,
    close: Arc<Notify>,
}

/// Public view of a connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub worker_id: String,
    pub name: String,
    pub version: String,
    pub connected_at: u64,
    pub last_seen_secs: u64,
}

/// Live worker connections keyed by worker id
#[derive(Clone, Default)]
pub struct WorkerConnections {
    inner: Arc<RwLock<HashMap<String, WorkerConnection>>>,
}

impl WorkerConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection, closing any previous one for the same worker
    async fn register(&self, connection: WorkerConnection) -> bool {
        let replaced = self
            .inner
            .write()
            .await
            .insert(connection.worker_id.clone(), connection);
        match replaced {
            Some(old) => {
                old.close.notify_one();
                true
            }
            None => false,
        }
    }

    /// Remove the worker's entry if it still belongs to `connection_id`
    async fn remove_if_current(&self, worker_id: &str, connection_id: Uuid) -> bool {
        let mut connections = self.inner.write().await;
        if connections
            .get(worker_id)
            .is_some_and(|c| c.id == connection_id)
        {
            connections.remove(worker_id);
            true
        } else {
            false
        }
    }

    async fn touch(&self, worker_id: &str, connection_id: Uuid) {
        if let Some(conn) = self.inner.write().await.get_mut(worker_id)
            && conn.id == connection_id
        {
            conn.last_seen = Instant::now();
        }
    }

    /// Drop and close every connection silent for longer than `stale_after`
    pub async fn remove_stale(&self, stale_after: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut connections = self.inner.write().await;
        let stale: Vec<String> = connections
            .values()
            .filter(|c| now.saturating_duration_since(c.last_seen) > stale_after)
            .map(|c| c.worker_id.clone())
            .collect();
        for worker_id in &stale {
            if let Some(conn) = connections.remove(worker_id) {
                conn.close.notify_one();
            }
        }
        stale
    }

    pub async fn is_connected(&self, worker_id: &str) -> bool {
        self.inner.read().await.contains_key(worker_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let now = Instant::now();
        let mut list: Vec<ConnectionInfo> = self
            .inner
            .read()
            .await
            .values()
            .map(|c| ConnectionInfo {
                worker_id: c.worker_id.clone(),
                name: c.name.clone(),
                version: c.version.clone(),
                connected_at: c.connected_at,
                last_seen_secs: now.saturating_duration_since(c.last_seen).as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        list
    }

    /// Wait until every writer has taken its queued messages, or `timeout` passes.
    /// Returns false on timeout.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.inner.read().await.values().any(|c| {
                !c.sender.is_closed() && c.sender.capacity() < c.sender.max_capacity()
            });
            if !pending {
                // the last frame taken may still be on its way to the socket
                tokio::time::sleep(FLUSH_POLL).await;
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(FLUSH_POLL).await;
        }
    }

    /// Queue a raw message for a worker without waiting
    pub async fn send(&self, worker_id: &str, message: ControllerMessage) -> Result<(), TransportError> {
        let connections = self.inner.read().await;
        let conn = connections
            .get(worker_id)
            .ok_or_else(|| TransportError::NotConnected(worker_id.to_string()))?;
        conn.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::SendBufferFull(worker_id.to_string()),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed(worker_id.to_string()),
        })
    }
}

#[async_trait]
impl WorkerTransport for WorkerConnections {
    async fn send_command(
        &self,
        worker_id: &str,
        command: WorkerCommand,
    ) -> Result<(), TransportError> {
        debug!(worker_id = %worker_id, kind = command.kind(), "Queueing command");
        self.send(worker_id, command.into()).await
    }

    async fn connected_worker_ids(&self) -> HashSet<String> {
        self.inner.read().await.keys().cloned().collect()
    }
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    if token.is_empty() {
        return true;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == token)
}

/// WebSocket upgrade handler for workers
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if !authorized(&headers, &state.config.server.auth_token) {
        warn!("Rejected worker connection with missing or invalid token");
        counter!("tidepool_ws_rejected_total").increment(1);
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a worker connection: registration, then the message loop
async fn handle_socket(socket: WebSocket, state: AppState) {
    let config = WsConfig::default();
    let connection_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The first frame must be a registration
    let registration = match tokio::time::timeout(config.register_timeout, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Envelope::<WorkerMessage>::from_json(&text).ok(),
        _ => None,
    };
    let Some(WorkerMessage::Register {
        worker_id,
        name,
        version,
        capabilities,
    }) = registration.map(|e| e.message)
    else {
        warn!("Connection {} closed: expected register message", connection_id);
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    };

    let (tx, mut rx) = mpsc::channel::<ControllerMessage>(SEND_BUFFER);
    let close = Arc::new(Notify::new());
    let replaced = state
        .connections
        .register(WorkerConnection {
            id: connection_id,
            worker_id: worker_id.clone(),
            name: name.clone(),
            version: version.clone(),
            connected_at: now_millis(),
            last_seen: Instant::now(),
            sender: tx.clone(),
            close: close.clone(),
        })
        .await;

    counter!("tidepool_ws_connections_total").increment(1);
    gauge!("tidepool_ws_connections_active").set(state.connections.len().await as f64);
    info!(
        worker_id = %worker_id,
        name = %name,
        version = %version,
        ?capabilities,
        replaced,
        "Worker registered"
    );
    state.scheduler.on_worker_connected(&worker_id).await;

    // Forward outgoing messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match Envelope::new(msg).to_json() {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                }
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // Keepalive health checks
    let health_tx = tx.clone();
    let health_worker = worker_id.clone();
    let health_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.health_check_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            let check = ControllerMessage::HealthCheck {
                request_id: Uuid::new_v4().to_string(),
            };
            match health_tx.try_send(check) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(worker_id = %health_worker, "Send buffer full, skipping health check");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    });
    drop(tx);

    loop {
        let frame = tokio::select! {
            _ = close.notified() => {
                info!(worker_id = %worker_id, "Closing replaced or stale connection");
                break;
            }
            frame = ws_receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                state.connections.touch(&worker_id, connection_id).await;
                match Envelope::<WorkerMessage>::from_json(&text) {
                    Ok(envelope) => handle_worker_message(envelope.message, &worker_id, &state),
                    Err(e) => {
                        warn!(worker_id = %worker_id, "Failed to parse worker message: {}", e);
                    }
                }
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                state.connections.touch(&worker_id, connection_id).await;
            }
            Some(Ok(Message::Binary(_))) => {
                debug!(worker_id = %worker_id, "Ignoring binary frame");
            }
            Some(Ok(Message::Close(_))) | None => {
                info!(worker_id = %worker_id, "Worker closed connection");
                break;
            }
            Some(Err(e)) => {
                error!("WebSocket error for {}: {}", worker_id, e);
                break;
            }
        }
    }

    // Cleanup
    health_task.abort();
    send_task.abort();

    if state
        .connections
        .remove_if_current(&worker_id, connection_id)
        .await
    {
        worker_gone(&state, &worker_id).await;
    }
    gauge!("tidepool_ws_connections_active").set(state.connections.len().await as f64);
    info!(worker_id = %worker_id, "Worker connection closed");
}

fn handle_worker_message(msg: WorkerMessage, worker_id: &str, state: &AppState) {
    match msg {
        WorkerMessage::Metrics(report) => state.aggregator.update(worker_id, report),
        WorkerMessage::HealthResponse { request_id, status } => {
            debug!(worker_id = %worker_id, request_id = %request_id, status = %status, "Health response");
        }
        WorkerMessage::Status {
            state: worker_state,
            active_commands,
            uptime_secs,
            last_error,
        } => {
            debug!(
                worker_id = %worker_id,
                state = ?worker_state,
                active = active_commands.len(),
                uptime_secs,
                ?last_error,
                "Worker status"
            );
        }
        WorkerMessage::Error {
            code,
            message,
            details,
        } => {
            error!(worker_id = %worker_id, ?code, ?details, "Worker error: {}", message);
        }
        WorkerMessage::Register { .. } => {
            warn!(worker_id = %worker_id, "Ignoring repeated registration");
        }
    }
}

/// Forget everything tied to a connection that went away
async fn worker_gone(state: &AppState, worker_id: &str) {
    state.aggregator.remove_worker(worker_id);
    state.scheduler.on_worker_disconnected(worker_id).await;
}

/// Periodically disconnect workers that stopped talking
pub async fn run_sweeper(
    state: AppState,
    interval: Duration,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for worker_id in state.connections.remove_stale(stale_after).await {
                    warn!(worker_id = %worker_id, "Worker went silent, dropping connection");
                    counter!("tidepool_ws_stale_total").increment(1);
                    worker_gone(&state, &worker_id).await;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
