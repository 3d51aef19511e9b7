//! Daemon configuration.
//!
//! Loaded from TOML, then overridden by environment variables. Every field
//! has a default, so an empty file (or no file at all) is a valid config.
//!
//! ```toml
//! listen = "0.0.0.0:8765"
//! wheel_device_type = "wheel-driver"
//! servo_device_type = "servo-driver"
//! lock_grace_ms = 5000
//!
//! [[servo]]
//! channel = 0
//! label = "left_shoulder"
//! min_angle = 0.0
//! max_angle = 180.0
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use fleet_core::{ActuationModel, ConfigurationError, DeviceId, DeviceType, ServoConfig};

use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::monitor::MonitorConfig;
use crate::router::RouterConfig;
use crate::server::{
    GatewayConfig, DEFAULT_CONTROL_SOCKET, DEFAULT_LISTEN_ADDR, MAX_LINE_BYTES,
    RESERVED_DEVICE_IDS,
};

/// Overrides the gateway listen address.
pub const ENV_LISTEN: &str = "FLEETD_LISTEN";

/// Overrides the control socket path.
pub const ENV_CONTROL_SOCKET: &str = "FLEETD_CONTROL_SOCKET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid servo table: {0}")]
    Servo(#[from] ConfigurationError),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    pub listen: String,
    pub control_socket: PathBuf,
    /// Receives `lock`/`unlock` around pose commands.
    pub wheel_device_type: DeviceType,
    /// Gets the servo table when it registers.
    pub servo_device_type: DeviceType,
    pub lock_grace_ms: u64,
    pub heartbeat_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Zero disables core-side pings.
    pub ping_interval_secs: u64,
    pub registration_timeout_secs: u64,
    /// Zero disables the debounce.
    pub registration_debounce_ms: u64,
    pub max_line_bytes: usize,
    pub history_capacity: usize,
    pub reserved_ids: Vec<DeviceId>,
    /// Servo channel table; empty means the default ten-channel body.
    #[serde(rename = "servo")]
    pub servos: Vec<ServoConfig>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDR.to_string(),
            control_socket: PathBuf::from(DEFAULT_CONTROL_SOCKET),
            wheel_device_type: DeviceType::new(DeviceType::WHEEL_DRIVER),
            servo_device_type: DeviceType::new(DeviceType::SERVO_DRIVER),
            lock_grace_ms: 5_000,
            heartbeat_timeout_secs: 90,
            sweep_interval_secs: 5,
            ping_interval_secs: 30,
            registration_timeout_secs: 10,
            registration_debounce_ms: 2_000,
            max_line_bytes: MAX_LINE_BYTES,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            reserved_ids: RESERVED_DEVICE_IDS
                .iter()
                .map(|id| DeviceId::new(*id))
                .collect(),
            servos: Vec::new(),
        }
    }
}

/// `~/.config/fleet/fleetd.toml` (platform equivalent).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fleet").join("fleetd.toml"))
}

impl FleetConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads the config file.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// used if present and built-in defaults otherwise. Environment
    /// overrides are applied and the result validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::read_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::read_file(&path)?,
                _ => Self::default(),
            },
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Applies `FLEETD_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup(ENV_LISTEN).filter(|v| !v.trim().is_empty()) {
            self.listen = listen;
        }
        if let Some(socket) = lookup(ENV_CONTROL_SOCKET).filter(|v| !v.trim().is_empty()) {
            self.control_socket = PathBuf::from(socket);
        }
    }

    /// Rejects settings that would make the daemon misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen must not be empty".into()));
        }
        if self.wheel_device_type.is_blank() {
            return Err(ConfigError::Invalid("wheel_device_type must not be empty".into()));
        }
        if self.servo_device_type.is_blank() {
            return Err(ConfigError::Invalid("servo_device_type must not be empty".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be > 0".into()));
        }
        if self.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::Invalid("heartbeat_timeout_secs must be > 0".into()));
        }
        if self.registration_timeout_secs == 0 {
            return Err(ConfigError::Invalid("registration_timeout_secs must be > 0".into()));
        }
        if self.lock_grace_ms == 0 {
            return Err(ConfigError::Invalid("lock_grace_ms must be > 0".into()));
        }
        if self.max_line_bytes == 0 {
            return Err(ConfigError::Invalid("max_line_bytes must be > 0".into()));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be > 0".into()));
        }
        self.actuation_model()?;
        Ok(())
    }

    pub fn actuation_model(&self) -> Result<ActuationModel, ConfigError> {
        if self.servos.is_empty() {
            return Ok(ActuationModel::default_fleet());
        }
        Ok(ActuationModel::new(self.servos.iter().cloned())?)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            registration_timeout: Duration::from_secs(self.registration_timeout_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            registration_debounce: Duration::from_millis(self.registration_debounce_ms),
            max_line_bytes: self.max_line_bytes,
            reserved_ids: self.reserved_ids.clone(),
            servo_device_type: self.servo_device_type.clone(),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            timeout: Duration::from_secs(self.heartbeat_timeout_secs),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            wheel_device_type: self.wheel_device_type.clone(),
            lock_grace: Duration::from_millis(self.lock_grace_ms),
        }
    }
}
