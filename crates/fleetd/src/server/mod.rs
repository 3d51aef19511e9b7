//! Controller gateway and operator control socket.
//!
//! The gateway:
//! - Listens on TCP for controller connections
//! - Spawns a ConnectionHandler for each one
//! - Stops accepting on shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  GatewayServer  │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌────────────────────┐
//! │ConnectionHandler│────▶│ ConnectionRegistry │  device id → session
//! │  (per device)   │     └────────────────────┘
//! │                 │     ┌────────────────────┐
//! │                 │────▶│   RegistryHandle   │  device records
//! │                 │     └────────────────────┘
//! │                 │     ┌────────────────────┐
//! │                 │────▶│ HistorySink/State  │  collaborators
//! └─────────────────┘     └────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the loop keeps going

mod connection;
mod control;
mod debounce;
mod framing;

pub use connection::{ConnectionError, ConnectionHandler};
pub use control::{handle_request, ControlContext, ControlServer, DEFAULT_CONTROL_SOCKET};
pub use debounce::{RegistrationDebouncer, DEFAULT_DEBOUNCE};
pub use framing::{read_line_bounded, Frame, MAX_LINE_BYTES};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use fleet_core::{ActuationModel, DeviceId, DeviceType};

use crate::connections::ConnectionRegistry;
use crate::history::HistorySink;
use crate::registry::RegistryHandle;
use crate::state::StateStore;

/// Default gateway listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8765";

/// Ids that only browser/dashboard clients ever used; controllers may not claim them.
pub const RESERVED_DEVICE_IDS: &[&str] = &["servo", "dashboard", "browser"];

pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Per-connection protocol settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// How long a new connection may take to send its registration.
    pub registration_timeout: Duration,
    /// Core-side ping period; zero disables pings.
    pub ping_interval: Duration,
    /// Repeated registrations of one id inside this window are refused.
    pub registration_debounce: Duration,
    pub max_line_bytes: usize,
    pub reserved_ids: Vec<DeviceId>,
    /// Devices of this type get the servo table in their registration ack.
    pub servo_device_type: DeviceType,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            registration_debounce: DEFAULT_DEBOUNCE,
            max_line_bytes: MAX_LINE_BYTES,
            reserved_ids: RESERVED_DEVICE_IDS
                .iter()
                .map(|id| DeviceId::new(*id))
                .collect(),
            servo_device_type: DeviceType::new(DeviceType::SERVO_DRIVER),
        }
    }
}

impl GatewayConfig {
    pub fn is_reserved(&self, device_id: &DeviceId) -> bool {
        self.reserved_ids.contains(device_id)
    }
}

/// Everything a connection handler needs. Cheap to clone.
#[derive(Clone)]
pub struct GatewayContext {
    pub registry: RegistryHandle,
    pub connections: ConnectionRegistry,
    pub history: Arc<dyn HistorySink>,
    pub state: Arc<dyn StateStore>,
    /// Source of the servo table sent to servo drivers.
    pub actuation: Arc<ActuationModel>,
    pub config: Arc<GatewayConfig>,
    debouncer: Arc<RegistrationDebouncer>,
}

impl GatewayContext {
    pub fn new(
        registry: RegistryHandle,
        connections: ConnectionRegistry,
        history: Arc<dyn HistorySink>,
        state: Arc<dyn StateStore>,
        actuation: Arc<ActuationModel>,
        config: GatewayConfig,
    ) -> Self {
        let debouncer = Arc::new(RegistrationDebouncer::new(config.registration_debounce));
        Self {
            registry,
            connections,
            history,
            state,
            actuation,
            config: Arc::new(config),
            debouncer,
        }
    }
}

/// TCP gateway accepting controller connections.
pub struct GatewayServer {
    listener: TcpListener,
    ctx: GatewayContext,
    cancel_token: CancellationToken,
}

impl GatewayServer {
    /// Binds the listener. Use port 0 to let the OS pick one.
    pub async fn bind(
        addr: &str,
        ctx: GatewayContext,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_string(),
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            ctx,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Io(e.to_string()))
    }

    /// Accepts connections until the cancellation token fires.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(addr = ?self.listener.local_addr().ok(), "Gateway listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Gateway shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }

        let active_sessions = self.ctx.connections.active_count().await;
        info!(active_sessions, "Gateway stopped");
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Could not set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            reader,
            writer,
            self.ctx.clone(),
            peer.to_string(),
            self.cancel_token.clone(),
        );

        tokio::spawn(async move {
            if let Some(device_id) = handler.run().await {
                debug!(device_id = %device_id, peer = %peer, "Connection task finished");
            }
        });
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },

    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("I/O error: {0}")]
    Io(String),
}
