//! Operator control socket messages.
//!
//! Local tooling (and the `fleetd route` subcommand) talks to a running
//! daemon with one JSON request per line and gets one response per line.

use fleet_core::{
    Command, CommandId, CommandRecord, CommandStatus, Device, DeviceId, DeviceState, DeviceType,
    HistoryEvent, ServoChannelState,
};
use serde::{Deserialize, Serialize};

/// Entries returned by history queries when no limit is given.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Requests accepted on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Route a named command to every online device of a type.
    Route {
        device_type: DeviceType,
        command_name: String,
        #[serde(default)]
        payload: serde_json::Value,
    },

    /// Move one servo channel; the daemon computes pulse and ticks.
    ServoAngle {
        device_type: DeviceType,
        channel: u8,
        angle: f64,
    },

    /// List every known device.
    ListDevices,

    /// One device with its latest status report.
    Device { device_id: DeviceId },

    /// Report whether the interlock is currently held.
    Interlock,

    /// One routed command and its current status.
    Command { command_id: CommandId },

    /// Most recent routed commands, optionally filtered.
    CommandLog {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_type: Option<DeviceType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<CommandStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    /// Status snapshots reported by one device, oldest first.
    StateHistory {
        device_id: DeviceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    /// Connects and disconnects of one device, oldest first.
    ConnectionHistory {
        device_id: DeviceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    /// Known servo channel positions for a device type.
    ServoState { device_type: DeviceType },
}

/// Responses written to the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Routed {
        command: Command,
    },
    Devices {
        devices: Vec<Device>,
    },
    Device {
        device: Device,
        state: Option<DeviceState>,
    },
    Interlock {
        locked: bool,
        /// Time left in the current lock window
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remaining_ms: Option<u64>,
    },
    Command {
        record: CommandRecord,
    },
    Commands {
        records: Vec<CommandRecord>,
    },
    History {
        events: Vec<HistoryEvent>,
    },
    ServoChannels {
        channels: Vec<ServoChannelState>,
    },
    Error {
        message: String,
    },
}

impl ControlResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
