//! Unix socket for operator tooling.
//!
//! One JSON [`ControlRequest`] per line in, one [`ControlResponse`] per
//! line out. This is how `fleetd route` and friends reach a running daemon.
//!
//! Besides routing, the socket answers read-only queries against the
//! in-memory ledger, the device registry and the state store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleet_protocol::{ControlRequest, ControlResponse, DEFAULT_QUERY_LIMIT};

use super::framing::{read_line_bounded, Frame, MAX_LINE_BYTES};
use super::ServerError;
use crate::history::MemoryHistory;
use crate::registry::RegistryHandle;
use crate::router::CommandRouter;
use crate::session::WRITE_TIMEOUT;
use crate::state::StateManager;

/// Default control socket path.
pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/fleetd.sock";

/// What control requests read from and act on. Cheap to clone.
#[derive(Clone)]
pub struct ControlContext {
    pub router: CommandRouter,
    pub registry: RegistryHandle,
    pub history: Arc<MemoryHistory>,
    pub state: Arc<StateManager>,
}

pub struct ControlServer {
    socket_path: PathBuf,
    ctx: ControlContext,
    cancel_token: CancellationToken,
}

impl ControlServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        ctx: ControlContext,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            ctx,
            cancel_token,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the socket (replacing a stale file) and serves until cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;

        info!(socket = %self.socket_path.display(), "Control socket listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Control socket shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let (reader, writer) = stream.into_split();
                            let ctx = self.ctx.clone();
                            let cancel_token = self.cancel_token.clone();
                            tokio::spawn(async move {
                                serve_client(reader, writer, ctx, cancel_token).await;
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept control connection"),
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_error)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }

        UnixListener::bind(&self.socket_path).map_err(setup_error)
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }
    }
}

async fn serve_client<R, W>(
    reader: R,
    writer: W,
    ctx: ControlContext,
    cancel_token: CancellationToken,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    loop {
        let frame = tokio::select! {
            _ = cancel_token.cancelled() => break,
            frame = read_line_bounded(&mut reader, MAX_LINE_BYTES) => frame,
        };

        let response = match frame {
            Ok(Frame::Eof) => break,
            Ok(Frame::Oversized { size }) => {
                ControlResponse::error(format!("request too large: {size} bytes"))
            }
            Ok(Frame::InvalidUtf8 { size }) => {
                ControlResponse::error(format!("request is not valid UTF-8: {size} bytes"))
            }
            Ok(Frame::Line(line)) if line.trim().is_empty() => continue,
            Ok(Frame::Line(line)) => match serde_json::from_str::<ControlRequest>(line.trim()) {
                Ok(request) => handle_request(request, &ctx).await,
                Err(e) => ControlResponse::error(format!("invalid request: {e}")),
            },
            Err(e) => {
                debug!(error = %e, "Control client read failed");
                break;
            }
        };

        if let Err(e) = write_response(&mut writer, &response).await {
            debug!(error = %e, "Control client write failed");
            break;
        }
    }
}

/// Executes one control request.
pub async fn handle_request(request: ControlRequest, ctx: &ControlContext) -> ControlResponse {
    let router = &ctx.router;
    match request {
        ControlRequest::Route {
            device_type,
            command_name,
            payload,
        } => match router.route(device_type, &command_name, payload).await {
            Ok(command) => ControlResponse::Routed { command },
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::ServoAngle {
            device_type,
            channel,
            angle,
        } => match router.route_servo_angle(device_type, channel, angle).await {
            Ok(command) => ControlResponse::Routed { command },
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::ListDevices => ControlResponse::Devices {
            devices: ctx.registry.list_all().await,
        },
        ControlRequest::Device { device_id } => {
            match ctx.registry.get(device_id.clone()).await {
                Some(device) => ControlResponse::Device {
                    device,
                    state: ctx.state.get(&device_id).await,
                },
                None => ControlResponse::error(format!("unknown device: {device_id}")),
            }
        }
        ControlRequest::Interlock => {
            let remaining = router.lock_remaining().await;
            ControlResponse::Interlock {
                locked: remaining.is_some(),
                remaining_ms: remaining.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            }
        }
        ControlRequest::Command { command_id } => match ctx.history.command(&command_id).await {
            Some(record) => ControlResponse::Command { record },
            None => ControlResponse::error(format!("unknown command: {command_id}")),
        },
        ControlRequest::CommandLog {
            device_type,
            status,
            limit,
        } => ControlResponse::Commands {
            records: ctx
                .history
                .recent_commands(
                    device_type.as_ref(),
                    status,
                    limit.unwrap_or(DEFAULT_QUERY_LIMIT),
                )
                .await,
        },
        ControlRequest::StateHistory { device_id, limit } => ControlResponse::History {
            events: ctx
                .history
                .state_history(&device_id, limit.unwrap_or(DEFAULT_QUERY_LIMIT))
                .await,
        },
        ControlRequest::ConnectionHistory { device_id, limit } => ControlResponse::History {
            events: ctx
                .history
                .connection_history(&device_id, limit.unwrap_or(DEFAULT_QUERY_LIMIT))
                .await,
        },
        ControlRequest::ServoState { device_type } => ControlResponse::ServoChannels {
            channels: ctx.state.servo_channels(&device_type).await,
        },
    }
}

async fn write_response<W>(
    writer: &mut BufWriter<W>,
    response: &ControlResponse,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response)?;
    let write = async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await
    };
    match timeout(WRITE_TIMEOUT, write).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")),
    }
}
