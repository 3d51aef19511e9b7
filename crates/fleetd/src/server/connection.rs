//! Connection handler for a single controller.
//!
//! Each accepted connection gets its own `ConnectionHandler` that:
//! - Waits for the registration message and binds the session to a device
//! - Decodes each following line and applies it to the registries
//! - Pings the controller periodically
//! - Unbinds the session and marks the device offline when the connection ends
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Malformed, oversized or non-UTF-8 lines are logged and dropped, the
//!   session stays open
//! - Transport errors end the connection, never the daemon

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use fleet_core::{CommandStatus, DeviceId, DeviceType, Metadata};
use fleet_protocol::{decode_device_line, CoreMessage, DeviceMessage, ParseError};

use super::framing::{read_line_bounded, Frame};
use super::GatewayContext;
use crate::registry::{OfflineReason, RegistryError};
use crate::session::{ConnectionId, LineSession, Session, TransportError};

/// Errors that end a controller connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Eof,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("No registration within {0:?}")]
    RegistrationTimeout(Duration),

    #[error("Expected registration, got {0}")]
    UnexpectedMessage(String),

    #[error("Invalid registration: {0}")]
    Parse(#[from] ParseError),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Registration line is not valid UTF-8 ({size} bytes)")]
    InvalidUtf8 { size: usize },

    #[error("Device id must not be blank")]
    BlankDeviceId,

    #[error("Reserved device id: {0}")]
    ReservedId(DeviceId),

    #[error("Registration for {0} debounced")]
    Debounced(DeviceId),

    #[error("Server shutting down")]
    Shutdown,

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

struct Registration {
    device_id: DeviceId,
    device_type: DeviceType,
    metadata: Metadata,
}

/// A connection after successful registration.
struct BoundDevice<W> {
    device_id: DeviceId,
    device_type: DeviceType,
    session: Arc<LineSession<W>>,
}

pub struct ConnectionHandler<R, W> {
    reader: BufReader<R>,
    /// Moved into the session once the device registers.
    writer: Option<W>,
    ctx: GatewayContext,
    peer: String,
    cancel_token: CancellationToken,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        reader: R,
        writer: W,
        ctx: GatewayContext,
        peer: impl Into<String>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Some(writer),
            ctx,
            peer: peer.into(),
            cancel_token,
        }
    }

    /// Runs the connection to completion.
    ///
    /// Returns the device id the connection was bound to, or `None` if
    /// registration was refused.
    pub async fn run(mut self) -> Option<DeviceId> {
        debug!(peer = %self.peer, "Controller connected");

        let registration = match self.await_registration().await {
            Ok(registration) => registration,
            Err(e) => {
                match &e {
                    ConnectionError::ReservedId(_) | ConnectionError::Debounced(_) => {
                        info!(peer = %self.peer, reason = %e, "Registration refused");
                    }
                    ConnectionError::Eof | ConnectionError::Shutdown => {
                        debug!(
                            peer = %self.peer,
                            reason = %e,
                            "Connection ended before registration"
                        );
                    }
                    _ => warn!(peer = %self.peer, error = %e, "Registration failed"),
                }
                return None;
            }
        };

        let mut bound = match self.bind(registration).await {
            Ok(bound) => bound,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Could not bind session");
                return None;
            }
        };

        let pinger = self.spawn_pinger(&bound);

        if let Err(e) = self.process_messages(&mut bound).await {
            debug!(device_id = %bound.device_id, error = %e, "Connection ended with error");
        }

        pinger.cancel();
        self.teardown(&bound).await;
        Some(bound.device_id)
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    async fn await_registration(&mut self) -> Result<Registration, ConnectionError> {
        let limit = self.ctx.config.registration_timeout;
        let max = self.ctx.config.max_line_bytes;

        let message = tokio::select! {
            biased;

            _ = self.cancel_token.cancelled() => return Err(ConnectionError::Shutdown),

            result = timeout(limit, first_message(&mut self.reader, max)) => {
                result.map_err(|_| ConnectionError::RegistrationTimeout(limit))??
            }
        };

        let (device_id, device_type, metadata) = match message {
            DeviceMessage::Registration {
                device_id,
                device_type,
                metadata,
            } => (device_id, device_type, metadata),
            other => return Err(ConnectionError::UnexpectedMessage(other.kind().to_string())),
        };

        if device_id.is_blank() {
            return Err(ConnectionError::BlankDeviceId);
        }
        if self.ctx.config.is_reserved(&device_id) {
            return Err(ConnectionError::ReservedId(device_id));
        }
        if !self.ctx.debouncer.admit(&device_id).await {
            return Err(ConnectionError::Debounced(device_id));
        }

        Ok(Registration {
            device_id,
            device_type,
            metadata: metadata.unwrap_or_default(),
        })
    }

    async fn bind(
        &mut self,
        registration: Registration,
    ) -> Result<BoundDevice<W>, ConnectionError> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| ConnectionError::Io("session already bound".to_string()))?;

        let session = Arc::new(LineSession::new(ConnectionId::next(), writer));
        let Registration {
            device_id,
            device_type,
            metadata,
        } = registration;

        self.ctx
            .connections
            .register(device_id.clone(), session.clone())
            .await;

        let device = match self
            .ctx
            .registry
            .register_or_refresh(device_id.clone(), device_type, metadata)
            .await
        {
            Ok(device) => device,
            Err(e) => {
                self.ctx
                    .connections
                    .unregister_session(&device_id, session.connection_id())
                    .await;
                if let Err(close_err) = session.close().await {
                    debug!(device_id = %device_id, error = %close_err, "Close after failed bind");
                }
                return Err(e.into());
            }
        };

        self.ctx.history.device_connected(&device).await;
        info!(
            device_id = %device.device_id,
            device_type = %device.device_type,
            peer = %self.peer,
            connection = %session.connection_id(),
            "Device registered"
        );

        if device.device_type == self.ctx.config.servo_device_type {
            let ack = CoreMessage::registration_ack(device_id.clone(), &self.ctx.actuation);
            if let Err(e) = session.send(&ack).await {
                debug!(device_id = %device_id, error = %e, "Could not send servo table");
            }
        }

        Ok(BoundDevice {
            device_id,
            device_type: device.device_type,
            session,
        })
    }

    // ------------------------------------------------------------------------
    // Message loop
    // ------------------------------------------------------------------------

    async fn process_messages(
        &mut self,
        bound: &mut BoundDevice<W>,
    ) -> Result<(), ConnectionError> {
        let closed = bound.session.closed_token();
        let max = self.ctx.config.max_line_bytes;

        loop {
            let frame = tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    debug!(device_id = %bound.device_id, "Shutdown, closing session");
                    return Ok(());
                }

                _ = closed.cancelled() => {
                    debug!(device_id = %bound.device_id, "Session closed by core");
                    return Ok(());
                }

                frame = read_line_bounded(&mut self.reader, max) => {
                    frame.map_err(|e| ConnectionError::Io(e.to_string()))?
                }
            };

            let line = match frame {
                Frame::Eof => return Ok(()),
                Frame::Oversized { size } => {
                    warn!(device_id = %bound.device_id, size, max, "Dropping oversized line");
                    continue;
                }
                Frame::InvalidUtf8 { size } => {
                    warn!(
                        device_id = %bound.device_id,
                        size,
                        "Dropping line that is not valid UTF-8"
                    );
                    continue;
                }
                Frame::Line(line) => line,
            };

            if line.trim().is_empty() {
                continue;
            }

            match decode_device_line(&line) {
                Ok(message) => self.handle_message(bound, message).await?,
                Err(e) if e.is_unknown_type() => {
                    warn!(
                        device_id = %bound.device_id,
                        error = %e,
                        "Ignoring message of unknown type"
                    );
                }
                Err(e) => {
                    warn!(device_id = %bound.device_id, error = %e, "Dropping malformed line");
                }
            }
        }
    }

    async fn handle_message(
        &self,
        bound: &mut BoundDevice<W>,
        message: DeviceMessage,
    ) -> Result<(), ConnectionError> {
        trace!(device_id = %bound.device_id, kind = message.kind(), "Received message");

        if let Some(claimed) = message.claimed_device_id() {
            let is_registration = matches!(message, DeviceMessage::Registration { .. });
            if claimed != &bound.device_id && !is_registration {
                debug!(
                    device_id = %bound.device_id,
                    claimed = %claimed,
                    "Message names another device, attributing to session owner"
                );
            }
        }

        match message {
            DeviceMessage::Registration {
                device_id,
                device_type,
                metadata,
            } => {
                if device_id != bound.device_id {
                    warn!(
                        device_id = %bound.device_id,
                        claimed = %device_id,
                        "Ignoring registration for another device on a bound session"
                    );
                    return Ok(());
                }
                let device = self
                    .ctx
                    .registry
                    .register_or_refresh(device_id, device_type, metadata.unwrap_or_default())
                    .await?;
                bound.device_type = device.device_type;
                debug!(device_id = %bound.device_id, "Registration refreshed");
            }

            DeviceMessage::Heartbeat { .. } | DeviceMessage::Pong { .. } => {
                self.ctx.registry.mark_online(bound.device_id.clone()).await;
            }

            DeviceMessage::Status {
                device_type,
                payload,
                ..
            } => {
                let device_type = device_type.unwrap_or_else(|| bound.device_type.clone());
                self.ctx
                    .history
                    .state_snapshot(&bound.device_id, &device_type, &payload)
                    .await;
                self.ctx
                    .state
                    .update_state(&bound.device_id, &device_type, payload)
                    .await;
            }

            DeviceMessage::CommandAck { command_id, status } => {
                let status = CommandStatus::from_ack(&status);
                debug!(
                    device_id = %bound.device_id,
                    command_id = %command_id,
                    status = %status,
                    "Command acknowledged"
                );
                self.ctx
                    .history
                    .command_acknowledged(&bound.device_id, &bound.device_type, &command_id, status)
                    .await;
            }

            DeviceMessage::ServoFeedback(feedback) => {
                self.ctx.registry.mark_online(bound.device_id.clone()).await;
                self.ctx
                    .state
                    .servo_feedback(&bound.device_id, &bound.device_type, &feedback)
                    .await;
            }

            DeviceMessage::ServoFault(fault) => {
                warn!(
                    device_id = %bound.device_id,
                    channel = ?fault.channel,
                    code = fault.error_code,
                    error = %fault.error_message,
                    "Controller reported a servo fault"
                );
                self.ctx.registry.mark_online(bound.device_id.clone()).await;
                self.ctx
                    .state
                    .servo_fault(&bound.device_id, &bound.device_type, &fault)
                    .await;
            }

            DeviceMessage::Ping { timestamp } => {
                bound.session.send(&CoreMessage::pong(timestamp)).await?;
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Keepalive and teardown
    // ------------------------------------------------------------------------

    /// Starts the core-side ping loop. Cancel the returned token to stop it.
    fn spawn_pinger(&self, bound: &BoundDevice<W>) -> CancellationToken {
        let stop = bound.session.closed_token().child_token();
        let period = self.ctx.config.ping_interval;
        if period.is_zero() {
            return stop;
        }

        let session = bound.session.clone();
        let device_id = bound.device_id.clone();
        let token = stop.clone();

        tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => break,

                    _ = tick.tick() => {
                        let ping = CoreMessage::ping(Utc::now().timestamp_millis());
                        if let Err(e) = session.send(&ping).await {
                            debug!(
                                device_id = %device_id,
                                error = %e,
                                "Ping failed, closing session"
                            );
                            if let Err(e) = session.close().await {
                                debug!(device_id = %device_id, error = %e, "Close failed");
                            }
                            break;
                        }
                    }
                }
            }
        });

        stop
    }

    async fn teardown(&self, bound: &BoundDevice<W>) {
        if let Err(e) = bound.session.close().await {
            debug!(device_id = %bound.device_id, error = %e, "Close during teardown");
        }

        let removed = self
            .ctx
            .connections
            .unregister_session(&bound.device_id, bound.session.connection_id())
            .await;

        if !removed && self.ctx.connections.is_active(&bound.device_id).await {
            debug!(
                device_id = %bound.device_id,
                connection = %bound.session.connection_id(),
                "Session superseded, leaving device online"
            );
            return;
        }

        let went_offline = self
            .ctx
            .registry
            .mark_offline(bound.device_id.clone(), OfflineReason::Disconnected)
            .await;

        if went_offline {
            self.ctx
                .history
                .device_disconnected(&bound.device_id, OfflineReason::Disconnected)
                .await;
            info!(device_id = %bound.device_id, "Device disconnected");
        }
    }
}

/// Reads until the first non-blank line and decodes it.
async fn first_message<R>(
    reader: &mut BufReader<R>,
    max: usize,
) -> Result<DeviceMessage, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = read_line_bounded(reader, max)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        match frame {
            Frame::Eof => return Err(ConnectionError::Eof),
            Frame::Oversized { size } => {
                return Err(ConnectionError::MessageTooLarge { size, max });
            }
            Frame::InvalidUtf8 { size } => return Err(ConnectionError::InvalidUtf8 { size }),
            Frame::Line(line) if line.trim().is_empty() => continue,
            Frame::Line(line) => return Ok(decode_device_line(&line)?),
        }
    }
}
