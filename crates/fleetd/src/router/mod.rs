//! Command routing and the wheel/pose interlock.
//!
//! A routed command fans out to every online device of its type. Before
//! dispatch the command is classified:
//!
//! - wheel movement is refused while the interlock is held
//! - an exclusive pose takes the interlock, tells the wheel driver to
//!   `lock`, and schedules an `unlock` after the grace period
//! - everything else goes straight through
//!
//! Routing never fails for runtime reasons. The outcome is recorded in the
//! returned command's status; `RouteError` is reserved for malformed calls.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Lock/unlock broadcasts are best effort and never fail a route

mod interlock;

pub use interlock::Interlock;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_core::{
    ActuationModel, Command, CommandClass, CommandStatus, ConfigurationError, DeviceType,
};
use fleet_protocol::CoreMessage;

use crate::connections::ConnectionRegistry;
use crate::history::HistorySink;
use crate::registry::RegistryHandle;
use crate::state::StateStore;

/// How long the wheels stay locked after a pose command.
pub const DEFAULT_LOCK_GRACE: Duration = Duration::from_secs(5);

/// Command name of single-servo moves built by [`CommandRouter::route_servo_angle`].
pub const SET_SERVO_COMMAND: &str = "set_servo";

#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    #[error("device_type must not be empty")]
    EmptyDeviceType,

    #[error("command_name must not be empty")]
    EmptyCommandName,

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Devices of this type receive `lock`/`unlock`.
    pub wheel_device_type: DeviceType,
    pub lock_grace: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            wheel_device_type: DeviceType::new(DeviceType::WHEEL_DRIVER),
            lock_grace: DEFAULT_LOCK_GRACE,
        }
    }
}

struct RouterInner {
    registry: RegistryHandle,
    connections: ConnectionRegistry,
    history: Arc<dyn HistorySink>,
    state: Arc<dyn StateStore>,
    actuation: Arc<ActuationModel>,
    config: RouterConfig,
    interlock: Mutex<Interlock>,
    cancel_token: CancellationToken,
}

/// Cheap-to-clone command router; clones share one interlock.
#[derive(Clone)]
pub struct CommandRouter {
    inner: Arc<RouterInner>,
}

impl CommandRouter {
    /// `cancel_token` stops pending unlock timers on shutdown.
    pub fn new(
        registry: RegistryHandle,
        connections: ConnectionRegistry,
        history: Arc<dyn HistorySink>,
        state: Arc<dyn StateStore>,
        actuation: Arc<ActuationModel>,
        config: RouterConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry,
                connections,
                history,
                state,
                actuation,
                config,
                interlock: Mutex::new(Interlock::new()),
                cancel_token,
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn actuation(&self) -> &ActuationModel {
        &self.inner.actuation
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.interlock.lock().await.is_locked()
    }

    /// Time left in the current lock window, `None` when unlocked.
    pub async fn lock_remaining(&self) -> Option<Duration> {
        let deadline = self.inner.interlock.lock().await.deadline()?;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    /// Routes `command_name` to every online device of `device_type`.
    ///
    /// The returned command is `sent` if at least one session accepted it,
    /// `no_devices` if none did, or `rejected_system_locked` for wheel
    /// movement during a pose.
    ///
    /// # Errors
    ///
    /// `EmptyDeviceType` / `EmptyCommandName` for blank arguments.
    pub async fn route(
        &self,
        device_type: DeviceType,
        command_name: &str,
        payload: serde_json::Value,
    ) -> Result<Command, RouteError> {
        if device_type.is_blank() {
            return Err(RouteError::EmptyDeviceType);
        }
        if command_name.trim().is_empty() {
            return Err(RouteError::EmptyCommandName);
        }

        let payload = if payload.is_null() {
            json!({})
        } else {
            payload
        };
        let mut command = Command::new(device_type, command_name, payload);

        match CommandClass::classify(command_name) {
            CommandClass::WheelMovement => {
                let admitted = self
                    .inner
                    .interlock
                    .lock()
                    .await
                    .admits(CommandClass::WheelMovement);
                if !admitted {
                    command.advance(CommandStatus::RejectedSystemLocked);
                    warn!(
                        command_id = %command.command_id,
                        command = %command.command_name,
                        "Wheel command rejected, system locked"
                    );
                    self.inner.history.command_routed(&command, 0).await;
                    return Ok(command);
                }
            }
            CommandClass::ExclusiveActuation => self.engage_interlock(&command).await,
            CommandClass::Unrestricted => {}
        }

        let delivered = self.dispatch(&command).await;
        let status = if delivered > 0 {
            CommandStatus::Sent
        } else {
            CommandStatus::NoDevices
        };
        command.advance(status);

        info!(
            command_id = %command.command_id,
            device_type = %command.device_type,
            command = %command.command_name,
            status = %status,
            delivered,
            "Command routed"
        );
        self.inner.history.command_routed(&command, delivered).await;

        Ok(command)
    }

    /// Moves one servo channel to `angle`.
    ///
    /// The angle is clamped to the channel's range. The payload carries the
    /// clamped angle, pulse width and both PWM tick encodings so firmware
    /// can drive either generator directly. Once sent, the clamped angle
    /// becomes the channel's target in the state store.
    ///
    /// # Errors
    ///
    /// `Configuration(UnknownChannel)` if the channel is not configured.
    pub async fn route_servo_angle(
        &self,
        device_type: DeviceType,
        channel: u8,
        angle: f64,
    ) -> Result<Command, RouteError> {
        let reading = self.inner.actuation.reading(channel, angle)?;
        let payload = json!({
            "channel": reading.channel,
            "angle": reading.angle,
            "pulse_us": reading.pulse_us,
            "pca9685_ticks": reading.pca9685_ticks,
            "ledc_ticks": reading.ledc_ticks,
        });
        let command = self
            .route(device_type.clone(), SET_SERVO_COMMAND, payload)
            .await?;
        if command.status() == CommandStatus::Sent {
            self.inner.state.servo_target(&device_type, &reading).await;
        }
        Ok(command)
    }

    /// Sends the command to each online device of its type; returns successes.
    async fn dispatch(&self, command: &Command) -> usize {
        let targets = self
            .inner
            .registry
            .list_online_by_type(command.device_type.clone())
            .await;
        let message = CoreMessage::command(command);

        let mut delivered = 0;
        for device in &targets {
            if self.inner.connections.send(&device.device_id, &message).await {
                delivered += 1;
            } else {
                debug!(
                    device_id = %device.device_id,
                    command_id = %command.command_id,
                    "Delivery failed"
                );
            }
        }
        delivered
    }

    async fn engage_interlock(&self, command: &Command) {
        let grace = self.inner.config.lock_grace;
        let (epoch, was_locked) = {
            let mut interlock = self.inner.interlock.lock().await;
            let was_locked = interlock.is_locked();
            (interlock.engage(Instant::now(), grace), was_locked)
        };

        if was_locked {
            debug!(epoch, command = %command.command_name, "Interlock window extended");
        } else {
            info!(epoch, command = %command.command_name, "Interlock engaged");
        }

        self.broadcast_control("lock").await;
        self.schedule_release(epoch, grace);
    }

    fn schedule_release(&self, epoch: u64, grace: Duration) {
        let router = self.clone();
        let cancel_token = self.inner.cancel_token.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    debug!(epoch, "Unlock timer cancelled by shutdown");
                }

                _ = tokio::time::sleep(grace) => {
                    router.release_interlock(epoch).await;
                }
            }
        });
    }

    async fn release_interlock(&self, epoch: u64) {
        let released = self.inner.interlock.lock().await.release(epoch);
        if released {
            info!(epoch, "Interlock released");
            self.broadcast_control("unlock").await;
        } else {
            debug!(epoch, "Stale unlock timer ignored");
        }
    }

    /// Best-effort control command to every online wheel driver.
    async fn broadcast_control(&self, name: &str) {
        let targets = self
            .inner
            .registry
            .list_online_by_type(self.inner.config.wheel_device_type.clone())
            .await;

        let message = CoreMessage::control(name);
        for device in &targets {
            if !self.inner.connections.send(&device.device_id, &message).await {
                debug!(device_id = %device.device_id, control = name, "Control broadcast failed");
            }
        }
    }
}
