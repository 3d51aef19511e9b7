//! Gateway harness shared by the TCP integration tests.
//!
//! Spawns a real `GatewayServer` on an ephemeral port with in-memory
//! collaborators, and a line-oriented controller client to talk to it.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use fleet_core::{ActuationModel, DeviceId, DeviceType};
use fleetd::history::MemoryHistory;
use fleetd::registry::{spawn_registry, RegistryHandle};
use fleetd::router::{CommandRouter, RouterConfig};
use fleetd::server::{GatewayConfig, GatewayContext, GatewayServer};
use fleetd::{ConnectionRegistry, StateManager};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for anything the tests wait on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period for server shutdown
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

// ============================================================================
// Gateway
// ============================================================================

/// Settings that keep tests fast and independent of wall-clock timers.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        registration_timeout: Duration::from_secs(2),
        ping_interval: Duration::ZERO,
        registration_debounce: Duration::ZERO,
        ..GatewayConfig::default()
    }
}

pub struct TestGateway {
    pub addr: SocketAddr,
    pub registry: RegistryHandle,
    pub connections: ConnectionRegistry,
    pub history: Arc<MemoryHistory>,
    pub state: Arc<StateManager>,
    pub router: CommandRouter,
    pub cancel_token: CancellationToken,
}

impl TestGateway {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config()).await
    }

    pub async fn spawn_with(config: GatewayConfig) -> Self {
        let registry = spawn_registry();
        let connections = ConnectionRegistry::new();
        let history = Arc::new(MemoryHistory::default());
        let state = Arc::new(StateManager::new());
        let actuation = Arc::new(ActuationModel::default_fleet());
        let cancel_token = CancellationToken::new();

        let router = CommandRouter::new(
            registry.clone(),
            connections.clone(),
            history.clone(),
            state.clone(),
            actuation.clone(),
            RouterConfig::default(),
            cancel_token.clone(),
        );

        let ctx = GatewayContext::new(
            registry.clone(),
            connections.clone(),
            history.clone(),
            state.clone(),
            actuation,
            config,
        );
        let server = GatewayServer::bind("127.0.0.1:0", ctx, cancel_token.clone())
            .await
            .expect("bind gateway");
        let addr = server.local_addr().expect("local addr");

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        Self {
            addr,
            registry,
            connections,
            history,
            state,
            router,
            cancel_token,
        }
    }

    pub async fn connect(&self) -> TestController {
        let stream = TcpStream::connect(self.addr).await.expect("connect to gateway");
        TestController::new(stream)
    }

    /// Connects and registers, returning once the device is online and bound.
    pub async fn register(&self, device_id: &str, device_type: &str) -> TestController {
        let mut controller = self.connect().await;
        controller
            .send(json!({
                "type": "registration",
                "device_id": device_id,
                "device_type": device_type,
            }))
            .await;
        self.wait_online(device_id).await;
        controller
    }

    pub async fn wait_online(&self, device_id: &str) {
        let id = DeviceId::new(device_id);
        let start = Instant::now();
        while start.elapsed() < WAIT_TIMEOUT {
            if self.is_online(device_id).await && self.connections.is_active(&id).await {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
        panic!("{device_id} did not come online within {WAIT_TIMEOUT:?}");
    }

    pub async fn wait_offline(&self, device_id: &str) {
        let start = Instant::now();
        while start.elapsed() < WAIT_TIMEOUT {
            if !self.is_online(device_id).await {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
        panic!("{device_id} did not go offline within {WAIT_TIMEOUT:?}");
    }

    pub async fn is_online(&self, device_id: &str) -> bool {
        matches!(self.registry.get(DeviceId::new(device_id)).await, Some(d) if d.is_online)
    }

    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

pub fn device_type(name: &str) -> DeviceType {
    DeviceType::new(name)
}

/// Polls `check` until it holds, failing the test after [`WAIT_TIMEOUT`].
///
/// `check` builds a fresh owned future each call, so clone what it needs.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < WAIT_TIMEOUT {
        if check().await {
            return;
        }
        sleep(POLL_INTERVAL).await;
    }
    panic!("condition not met within {WAIT_TIMEOUT:?}");
}

// ============================================================================
// Controller client
// ============================================================================

/// Plays the firmware side of a connection.
pub struct TestController {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestController {
    fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn send(&mut self, message: Value) {
        let line = serde_json::to_string(&message).expect("serialize");
        self.send_raw(&format!("{line}\n")).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.send_bytes(text.as_bytes()).await;
    }

    /// Writes bytes as-is, for lines that are not valid text.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    /// Next message from the core.
    pub async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let read = timeout(WAIT_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("message within timeout")
            .expect("read");
        assert!(read > 0, "connection closed while waiting for a message");
        serde_json::from_str(line.trim()).expect("core sent valid JSON")
    }

    /// Next message whose `type` is `kind`, skipping anything else.
    pub async fn recv_kind(&mut self, kind: &str) -> Value {
        loop {
            let message = self.recv().await;
            if message["type"] == kind {
                return message;
            }
        }
    }

    /// Asserts the core closes the connection.
    pub async fn expect_closed(&mut self) {
        let mut line = String::new();
        let result = timeout(WAIT_TIMEOUT, async {
            loop {
                line.clear();
                match self.reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => return,
                    // Drain anything written before the close (pings, etc).
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(result.is_ok(), "connection was not closed within {WAIT_TIMEOUT:?}");
    }

    /// Round-trips a ping to prove the session is still served.
    pub async fn assert_alive(&mut self, marker: i64) {
        self.send(json!({"type": "ping", "timestamp": marker})).await;
        let pong = self.recv_kind("pong").await;
        assert_eq!(pong["timestamp"], json!(marker));
    }
}
