//! Integration tests for the controller's HTTP and WebSocket surfaces

mod common;

use common::*;
use futures_util::{SinkExt, StreamExt};
use tidepool_protocol::{ControllerMessage, Envelope, MetricsReport, StopCommand, WorkerMessage};
use tokio_tungstenite::tungstenite::{self, Message, client::IntoClientRequest};

mod http_routes {
    use super::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_health_endpoint_returns_ok() {
        let (app, _) = create_test_app_with_state();

        let (status, json) = get_json(&app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert!(json["version"].is_string());
        assert_eq!(json["connected_workers"], 0);
    }

    #[tokio::test]
    async fn test_status_before_first_rotation() {
        let (app, _) = create_test_app_with_state();

        let (status, json) = get_json(&app, "/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["phase"], "idle");
        assert_eq!(json["rotation_count"], 0);
        assert_eq!(json["target_mbps"], 3000.0);
        assert_eq!(json["allocations"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_workers_lists_configured_fleet() {
        let (app, _) = create_test_app_with_state();

        let (status, json) = get_json(&app, "/workers").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 3);
        assert_eq!(json["connected"], 0);
        let names: Vec<&str> = json["workers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|w| w["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["edge-1", "edge-2", "edge-3"]);
    }

    #[tokio::test]
    async fn test_metrics_reflect_reports() {
        let (app, state) = create_test_app_with_state();
        state.aggregator.update(
            "w1",
            MetricsReport {
                current_mbps: 1500.0,
                average_mbps: 1400.0,
                bytes_downloaded: 1 << 30,
                active_commands: 1,
                commands: vec![],
            },
        );

        let (status, json) = get_json(&app, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_mbps"], 1500.0);
        assert_eq!(json["percent_of_target"], 50.0);
        assert_eq!(json["reporting_workers"], 1);
    }

    #[tokio::test]
    async fn test_history_rejects_bad_window() {
        let (app, _) = create_test_app_with_state();

        let (status, json) = get_json(&app, "/history?window=forever").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "invalid_window");
    }

    #[tokio::test]
    async fn test_stats_empty_window() {
        let (app, _) = create_test_app_with_state();

        let (status, json) = get_json(&app, "/stats?window=5m").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["window_secs"], 300);
        assert!(json["stats"].is_null());
    }

    #[tokio::test]
    async fn test_prometheus_without_exporter() {
        let (app, _) = create_test_app_with_state();

        let (status, _) = get_json(&app, "/metrics/prometheus").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}

mod worker_socket {
    use super::*;

    fn ws_request(
        addr: std::net::SocketAddr,
        token: &str,
    ) -> tungstenite::handshake::client::Request {
        let mut request = format!("ws://{}/ws", addr).into_client_request().unwrap();
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", token).parse().unwrap(),
        );
        request
    }

    fn frame(message: WorkerMessage) -> Message {
        Message::Text(Envelope::new(message).to_json().unwrap().into())
    }

    fn register(worker_id: &str) -> Message {
        frame(WorkerMessage::Register {
            worker_id: worker_id.to_string(),
            name: format!("agent-{}", worker_id),
            version: "0.1.0".to_string(),
            capabilities: vec!["http".to_string()],
        })
    }

    #[tokio::test]
    async fn test_bad_token_is_rejected() {
        let (addr, _) = spawn_server().await;

        let result = tokio_tungstenite::connect_async(ws_request(addr, "wrong")).await;

        match result {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
            other => panic!("expected 401, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_register_then_report() {
        let (addr, state) = spawn_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(ws_request(addr, TOKEN))
            .await
            .unwrap();

        ws.send(register("w2")).await.unwrap();
        assert!(eventually(|| state.connections.is_connected("w2")).await);

        ws.send(frame(WorkerMessage::Metrics(MetricsReport {
            current_mbps: 640.0,
            average_mbps: 600.0,
            bytes_downloaded: 4096,
            active_commands: 1,
            commands: vec![],
        })))
        .await
        .unwrap();
        assert!(
            eventually(|| async {
                state
                    .aggregator
                    .worker("w2")
                    .is_some_and(|m| m.current_mbps == 640.0)
            })
            .await
        );

        ws.close(None).await.unwrap();
        assert!(eventually(|| async { !state.connections.is_connected("w2").await }).await);
        assert!(state.aggregator.worker("w2").is_none());
    }

    #[tokio::test]
    async fn test_controller_commands_reach_worker() {
        let (addr, state) = spawn_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(ws_request(addr, TOKEN))
            .await
            .unwrap();
        ws.send(register("w1")).await.unwrap();
        assert!(eventually(|| state.connections.is_connected("w1")).await);

        state
            .connections
            .send("w1", ControllerMessage::StopCommand(StopCommand::all()))
            .await
            .unwrap();

        let text = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        };
        let envelope: Envelope<ControllerMessage> = Envelope::from_json(&text).unwrap();
        match envelope.message {
            ControllerMessage::StopCommand(stop) => assert!(stop.is_stop_all()),
            other => panic!("expected stop command, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_frame_must_register() {
        let (addr, state) = spawn_server().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(ws_request(addr, TOKEN))
            .await
            .unwrap();

        ws.send(frame(WorkerMessage::Metrics(MetricsReport::default())))
            .await
            .unwrap();

        let closed = loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break true,
                Some(Ok(_)) => continue,
            }
        };
        assert!(closed);
        assert_eq!(state.connections.len().await, 0);
    }
}
