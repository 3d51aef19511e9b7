//! Session message envelope.
//!
//! Every line on a controller connection is one JSON object tagged by
//! `type`. Inbound and outbound directions are separate closed enums so a
//! message is decoded once at the connection boundary and matched
//! exhaustively afterwards.

use fleet_core::{
    ActuationModel, Command, CommandId, DeviceId, DeviceType, Metadata, ServoConfig, ServoFault,
    ServoFeedback,
};
use serde::{Deserialize, Serialize};

/// Messages sent by a controller to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// First message on a connection; binds the session to `device_id`.
    Registration {
        device_id: DeviceId,
        device_type: DeviceType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },

    /// Liveness signal.
    Heartbeat {
        /// Redundant with the session binding; checked when present
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceId>,
    },

    /// Device state report, forwarded to the state store.
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_type: Option<DeviceType>,
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// Completion report for a previously sent command.
    CommandAck {
        command_id: CommandId,
        #[serde(default = "default_ack_status")]
        status: String,
    },

    /// Keepalive ping from the device.
    Ping {
        #[serde(default)]
        timestamp: serde_json::Value,
    },

    /// Answer to a core ping.
    Pong {
        #[serde(default)]
        timestamp: serde_json::Value,
    },

    /// Measured position of one servo channel.
    #[serde(rename = "feedback")]
    ServoFeedback(ServoFeedback),

    /// Hardware fault on a channel or the whole board.
    #[serde(rename = "error")]
    ServoFault(ServoFault),
}

fn default_ack_status() -> String {
    "success".to_string()
}

impl DeviceMessage {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registration { .. } => "registration",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Status { .. } => "status",
            Self::CommandAck { .. } => "command_ack",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::ServoFeedback(_) => "feedback",
            Self::ServoFault(_) => "error",
        }
    }

    /// The device id carried in the message body, if any.
    pub fn claimed_device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::Registration { device_id, .. } => Some(device_id),
            Self::Heartbeat { device_id } | Self::Status { device_id, .. } => device_id.as_ref(),
            Self::CommandAck { .. }
            | Self::Ping { .. }
            | Self::Pong { .. }
            | Self::ServoFeedback(_)
            | Self::ServoFault(_) => None,
        }
    }
}

/// Wire names accepted from controllers.
pub const DEVICE_MESSAGE_KINDS: &[&str] = &[
    "registration",
    "heartbeat",
    "status",
    "command_ack",
    "ping",
    "pong",
    "feedback",
    "error",
];

/// One row of the servo table sent to a servo driver after it registers.
///
/// Field names follow what the firmware parses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoTableEntry {
    #[serde(rename = "ch")]
    pub channel: u8,
    pub label: String,
    #[serde(rename = "minA")]
    pub min_angle: f64,
    #[serde(rename = "maxA")]
    pub max_angle: f64,
    #[serde(rename = "minPulse")]
    pub min_pulse_us: u32,
    #[serde(rename = "maxPulse")]
    pub max_pulse_us: u32,
    #[serde(rename = "home")]
    pub home_angle: f64,
}

impl From<&ServoConfig> for ServoTableEntry {
    fn from(config: &ServoConfig) -> Self {
        let (min_angle, max_angle) = config.angle_range();
        let (min_pulse_us, max_pulse_us) = config.pulse_range();
        Self {
            channel: config.channel(),
            label: config.label().to_string(),
            min_angle,
            max_angle,
            min_pulse_us,
            max_pulse_us,
            home_angle: config.home_angle(),
        }
    }
}

/// `status` of a registration ack.
pub const REGISTERED: &str = "registered";

/// Messages sent by the core to a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreMessage {
    /// Instruction to execute; acknowledged with `command_ack`.
    Command {
        command_id: CommandId,
        command_name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// Keepalive ping from the core.
    Ping { timestamp: serde_json::Value },

    /// Answer to a device ping, echoing its timestamp.
    Pong { timestamp: serde_json::Value },

    /// Confirms a registration. Servo drivers also get their channel table.
    Ack {
        device_id: DeviceId,
        status: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        servos: Vec<ServoTableEntry>,
    },
}

impl CoreMessage {
    /// Builds the dispatch message for a routed command.
    pub fn command(command: &Command) -> Self {
        Self::Command {
            command_id: command.command_id.clone(),
            command_name: command.command_name.clone(),
            payload: command.payload.clone(),
        }
    }

    /// Builds an out-of-band control instruction (e.g. `lock`, `unlock`).
    ///
    /// Carries a fresh id but is not tracked in the command history.
    pub fn control(name: &str) -> Self {
        Self::Command {
            command_id: CommandId::generate(),
            command_name: name.to_string(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn ping(timestamp: impl Into<serde_json::Value>) -> Self {
        Self::Ping {
            timestamp: timestamp.into(),
        }
    }

    pub fn pong(timestamp: serde_json::Value) -> Self {
        Self::Pong { timestamp }
    }

    /// Registration ack carrying every configured channel of `model`.
    pub fn registration_ack(device_id: DeviceId, model: &ActuationModel) -> Self {
        Self::Ack {
            device_id,
            status: REGISTERED.to_string(),
            servos: model.channels().map(ServoTableEntry::from).collect(),
        }
    }

    /// Serializes to a single JSON line without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
