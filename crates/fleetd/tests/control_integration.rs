//! Integration tests for the operator control socket.
//!
//! Tests may use `.unwrap()` and `.expect()`; production code may not.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use fleet_core::{
    ActuationModel, CommandId, CommandStatus, DeviceId, DeviceType, HistoryEvent, Metadata,
    OfflineReason,
};
use fleet_protocol::{ControlRequest, ControlResponse};
use fleetd::history::{HistorySink, MemoryHistory};
use fleetd::registry::{spawn_registry, RegistryHandle};
use fleetd::router::{CommandRouter, RouterConfig, DEFAULT_LOCK_GRACE};
use fleetd::server::ControlContext;
use fleetd::state::StateStore;
use fleetd::{ConnectionRegistry, ControlServer, StateManager};

// ============================================================================
// Test Helpers
// ============================================================================

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Control context over fresh in-memory collaborators.
fn test_context(cancel_token: &CancellationToken) -> ControlContext {
    let registry = spawn_registry();
    let history = Arc::new(MemoryHistory::default());
    let state = Arc::new(StateManager::new());
    let router = CommandRouter::new(
        registry.clone(),
        ConnectionRegistry::new(),
        history.clone(),
        state.clone(),
        Arc::new(ActuationModel::default_fleet()),
        RouterConfig::default(),
        cancel_token.clone(),
    );
    ControlContext {
        router,
        registry,
        history,
        state,
    }
}

struct TestControl {
    socket_path: PathBuf,
    registry: RegistryHandle,
    history: Arc<MemoryHistory>,
    state: Arc<StateManager>,
    cancel_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestControl {
    async fn spawn() -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("run").join("fleetd.sock");

        let cancel_token = CancellationToken::new();
        let ctx = test_context(&cancel_token);
        let registry = ctx.registry.clone();
        let history = ctx.history.clone();
        let state = ctx.state.clone();

        let server = ControlServer::new(socket_path.clone(), ctx, cancel_token.clone());
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT && !socket_path.exists() {
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(
            socket_path.exists(),
            "Control socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            registry,
            history,
            state,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    async fn add_device(&self, device_id: &str, device_type: &str) {
        let device = self
            .registry
            .register_or_refresh(
                DeviceId::new(device_id),
                DeviceType::new(device_type),
                Metadata::new(),
            )
            .await
            .unwrap();
        self.history.device_connected(&device).await;
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to control socket");
        let (reader, writer) = stream.into_split();
        TestClient {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn send_raw(&mut self, line: &str) -> ControlResponse {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.read_response().await
    }

    async fn read_response(&mut self) -> ControlResponse {
        self.writer.flush().await.unwrap();
        let mut response = String::new();
        timeout(RESPONSE_TIMEOUT, self.reader.read_line(&mut response))
            .await
            .expect("response within timeout")
            .expect("read response");
        serde_json::from_str(response.trim()).expect("valid response")
    }

    async fn request(&mut self, request: &ControlRequest) -> ControlResponse {
        let line = serde_json::to_string(request).unwrap();
        self.send_raw(&line).await
    }
}

// ============================================================================
// Routing and devices
// ============================================================================

#[tokio::test]
async fn test_list_devices() {
    let control = TestControl::spawn().await;
    control.add_device("wheels", "wheel-driver").await;

    let mut client = control.connect().await;
    match client.request(&ControlRequest::ListDevices).await {
        ControlResponse::Devices { devices } => {
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].device_id, DeviceId::new("wheels"));
            assert!(devices[0].is_online);
        }
        other => panic!("Expected Devices, got {other:?}"),
    }

    control.cancel_token.cancel();
}

#[tokio::test]
async fn test_route_and_interlock_status() {
    let control = TestControl::spawn().await;
    let mut client = control.connect().await;

    assert_eq!(
        client.request(&ControlRequest::Interlock).await,
        ControlResponse::Interlock {
            locked: false,
            remaining_ms: None,
        }
    );

    let response = client
        .request(&ControlRequest::Route {
            device_type: DeviceType::new("servo-driver"),
            command_name: "handsup".to_string(),
            payload: json!({"speed": 1}),
        })
        .await;
    match response {
        ControlResponse::Routed { command } => {
            assert_eq!(command.command_name, "handsup");
            assert_eq!(command.status(), CommandStatus::NoDevices);
        }
        other => panic!("Expected Routed, got {other:?}"),
    }

    match client.request(&ControlRequest::Interlock).await {
        ControlResponse::Interlock {
            locked,
            remaining_ms,
        } => {
            assert!(locked);
            let remaining = remaining_ms.expect("remaining time while locked");
            assert!(remaining <= DEFAULT_LOCK_GRACE.as_millis() as u64);
        }
        other => panic!("Expected Interlock, got {other:?}"),
    }

    control.cancel_token.cancel();
}

#[tokio::test]
async fn test_servo_angle_request() {
    let control = TestControl::spawn().await;
    let mut client = control.connect().await;

    let response = client
        .request(&ControlRequest::ServoAngle {
            device_type: DeviceType::new("servo-driver"),
            channel: 8,
            angle: 45.0,
        })
        .await;
    match response {
        ControlResponse::Routed { command } => {
            assert_eq!(command.payload["channel"], json!(8));
            assert_eq!(command.payload["pulse_us"], json!(1250));
        }
        other => panic!("Expected Routed, got {other:?}"),
    }

    let response = client
        .request(&ControlRequest::ServoAngle {
            device_type: DeviceType::new("servo-driver"),
            channel: 14,
            angle: 45.0,
        })
        .await;
    assert!(matches!(response, ControlResponse::Error { message } if message.contains("14")));

    control.cancel_token.cancel();
}

#[tokio::test]
async fn test_bad_requests_keep_connection() {
    let control = TestControl::spawn().await;
    let mut client = control.connect().await;

    assert!(matches!(client.send_raw("not json").await, ControlResponse::Error { .. }));
    assert!(matches!(
        client.send_raw(r#"{"type":"route","device_type":"","command_name":"x"}"#).await,
        ControlResponse::Error { .. }
    ));
    assert!(matches!(
        client.send_raw(r#"{"type":"self_destruct"}"#).await,
        ControlResponse::Error { .. }
    ));

    let mut raw = b"{\"type\":\"device\",\"device_id\":\"\xff\"}".to_vec();
    raw.push(b'\n');
    client.writer.write_all(&raw).await.unwrap();
    let response = client.read_response().await;
    assert!(matches!(response, ControlResponse::Error { message } if message.contains("UTF-8")));

    assert_eq!(
        client.request(&ControlRequest::Interlock).await,
        ControlResponse::Interlock {
            locked: false,
            remaining_ms: None,
        }
    );

    control.cancel_token.cancel();
}

#[tokio::test]
async fn test_shutdown_removes_socket() {
    let control = TestControl::spawn().await;
    let path = control.socket_path.clone();

    control.cancel_token.cancel();

    let start = Instant::now();
    while start.elapsed() < SOCKET_WAIT_TIMEOUT && path.exists() {
        sleep(SOCKET_POLL_INTERVAL).await;
    }
    assert!(!path.exists());
}

#[tokio::test]
async fn test_stale_socket_file_is_replaced() {
    let temp_dir = tempfile::tempdir().unwrap();
    let socket_path = temp_dir.path().join("fleetd.sock");
    std::fs::write(&socket_path, b"stale").unwrap();

    let cancel_token = CancellationToken::new();
    let server = ControlServer::new(
        socket_path.clone(),
        test_context(&cancel_token),
        cancel_token.clone(),
    );
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    let start = Instant::now();
    loop {
        if UnixStream::connect(&socket_path).await.is_ok() {
            break;
        }
        assert!(start.elapsed() < SOCKET_WAIT_TIMEOUT, "socket never became connectable");
        sleep(SOCKET_POLL_INTERVAL).await;
    }

    cancel_token.cancel();
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_device_query_includes_latest_state() {
    let control = TestControl::spawn().await;
    control.add_device("head", "servo-driver").await;
    control
        .state
        .update_state(
            &DeviceId::new("head"),
            &DeviceType::new("servo-driver"),
            json!({"battery": 81}),
        )
        .await;

    let mut client = control.connect().await;
    match client
        .request(&ControlRequest::Device {
            device_id: DeviceId::new("head"),
        })
        .await
    {
        ControlResponse::Device { device, state } => {
            assert_eq!(device.device_id, DeviceId::new("head"));
            assert_eq!(state.expect("state").payload, json!({"battery": 81}));
        }
        other => panic!("Expected Device, got {other:?}"),
    }

    let response = client
        .request(&ControlRequest::Device {
            device_id: DeviceId::new("ghost"),
        })
        .await;
    assert!(matches!(response, ControlResponse::Error { message } if message.contains("ghost")));

    control.cancel_token.cancel();
}

#[tokio::test]
async fn test_command_status_and_log() {
    let control = TestControl::spawn().await;
    let mut client = control.connect().await;

    let mut routed = Vec::new();
    for (device_type, name) in [
        ("wheel-driver", "forward"),
        ("servo-driver", "wave"),
        ("wheel-driver", "stop"),
    ] {
        match client
            .request(&ControlRequest::Route {
                device_type: DeviceType::new(device_type),
                command_name: name.to_string(),
                payload: json!({}),
            })
            .await
        {
            ControlResponse::Routed { command } => routed.push(command),
            other => panic!("Expected Routed, got {other:?}"),
        }
    }

    match client
        .request(&ControlRequest::Command {
            command_id: routed[1].command_id.clone(),
        })
        .await
    {
        ControlResponse::Command { record } => {
            assert_eq!(record.command.command_name, "wave");
            assert_eq!(record.status(), CommandStatus::NoDevices);
        }
        other => panic!("Expected Command, got {other:?}"),
    }

    let response = client
        .request(&ControlRequest::Command {
            command_id: CommandId::new("missing"),
        })
        .await;
    assert!(matches!(response, ControlResponse::Error { .. }));

    match client
        .request(&ControlRequest::CommandLog {
            device_type: Some(DeviceType::new("wheel-driver")),
            status: None,
            limit: None,
        })
        .await
    {
        ControlResponse::Commands { records } => {
            let names: Vec<&str> = records
                .iter()
                .map(|r| r.command.command_name.as_str())
                .collect();
            assert_eq!(names, vec!["forward", "stop"]);
        }
        other => panic!("Expected Commands, got {other:?}"),
    }

    match client
        .request(&ControlRequest::CommandLog {
            device_type: None,
            status: Some(CommandStatus::NoDevices),
            limit: Some(1),
        })
        .await
    {
        ControlResponse::Commands { records } => {
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].command.command_name, "stop");
        }
        other => panic!("Expected Commands, got {other:?}"),
    }

    control.cancel_token.cancel();
}

#[tokio::test]
async fn test_connection_and_state_history() {
    let control = TestControl::spawn().await;
    let wheels = DeviceId::new("wheels");
    control.add_device("wheels", "wheel-driver").await;
    control
        .history
        .state_snapshot(&wheels, &DeviceType::new("wheel-driver"), &json!({"speed": 0}))
        .await;
    control
        .history
        .device_disconnected(&wheels, OfflineReason::HeartbeatTimeout)
        .await;

    let mut client = control.connect().await;
    match client
        .request(&ControlRequest::ConnectionHistory {
            device_id: wheels.clone(),
            limit: None,
        })
        .await
    {
        ControlResponse::History { events } => {
            assert_eq!(events.len(), 2);
            assert!(matches!(events[0], HistoryEvent::Connected { .. }));
            assert!(matches!(
                events[1],
                HistoryEvent::Disconnected {
                    reason: OfflineReason::HeartbeatTimeout,
                    ..
                }
            ));
        }
        other => panic!("Expected History, got {other:?}"),
    }

    match client
        .request(&ControlRequest::StateHistory {
            device_id: wheels,
            limit: Some(10),
        })
        .await
    {
        ControlResponse::History { events } => {
            assert!(matches!(
                events.as_slice(),
                [HistoryEvent::Snapshot { payload, .. }] if payload == &json!({"speed": 0})
            ));
        }
        other => panic!("Expected History, got {other:?}"),
    }

    control.cancel_token.cancel();
}

#[tokio::test]
async fn test_servo_state_query() {
    let control = TestControl::spawn().await;
    let servo = DeviceType::new("servo-driver");
    control
        .state
        .servo_feedback(
            &DeviceId::new("servoscontroller"),
            &servo,
            &fleet_core::ServoFeedback {
                channel: 3,
                current_angle: 42.0,
                target_angle: Some(42.0),
                pulse_width_us: Some(1233),
                pca9685_ticks: None,
                is_moving: false,
            },
        )
        .await;

    let mut client = control.connect().await;
    match client
        .request(&ControlRequest::ServoState {
            device_type: servo,
        })
        .await
    {
        ControlResponse::ServoChannels { channels } => {
            assert_eq!(channels.len(), 1);
            assert_eq!(channels[0].channel, 3);
            assert_eq!(channels[0].current_angle, Some(42.0));
        }
        other => panic!("Expected ServoChannels, got {other:?}"),
    }

    match client
        .request(&ControlRequest::ServoState {
            device_type: DeviceType::new("arm"),
        })
        .await
    {
        ControlResponse::ServoChannels { channels } => assert!(channels.is_empty()),
        other => panic!("Expected ServoChannels, got {other:?}"),
    }

    control.cancel_token.cancel();
}
