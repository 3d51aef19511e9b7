//! Records the daemon keeps about devices and commands.
//!
//! These are what operator tooling reads back: the command ledger, the
//! connection and state timelines of a device, its latest status report,
//! and the last known position of each servo channel.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandStatus};
use crate::device::{DeviceId, DeviceType};

/// Why a device was marked offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
    /// The connection closed or failed.
    Disconnected,

    /// No heartbeat within the configured timeout.
    HeartbeatTimeout,
}

impl fmt::Display for OfflineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "connection closed"),
            Self::HeartbeatTimeout => write!(f, "heartbeat timeout"),
        }
    }
}

/// A routed command and how far it got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: Command,
    pub target_count: usize,
    /// Device that acknowledged last, if any.
    pub acknowledged_by: Option<DeviceId>,
}

impl CommandRecord {
    pub fn status(&self) -> CommandStatus {
        self.command.status()
    }
}

/// One connection or state event on a device's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    Connected {
        device_id: DeviceId,
        device_type: DeviceType,
        at: DateTime<Utc>,
    },
    Disconnected {
        device_id: DeviceId,
        reason: OfflineReason,
        at: DateTime<Utc>,
    },
    Snapshot {
        device_id: DeviceId,
        device_type: DeviceType,
        payload: serde_json::Value,
        at: DateTime<Utc>,
    },
}

impl HistoryEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::Connected { device_id, .. }
            | Self::Disconnected { device_id, .. }
            | Self::Snapshot { device_id, .. } => device_id,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Connected { at, .. }
            | Self::Disconnected { at, .. }
            | Self::Snapshot { at, .. } => *at,
        }
    }

    /// Returns true for connect and disconnect events.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connected { .. } | Self::Disconnected { .. })
    }
}

/// Last status payload received from one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    pub payload: serde_json::Value,
    pub last_updated: DateTime<Utc>,
}

/// What the core knows about one servo channel of a device type.
///
/// `target_angle` comes from commands the core sent; the rest from what
/// controllers reported back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServoChannelState {
    pub channel: u8,
    pub target_angle: Option<f64>,
    pub current_angle: Option<f64>,
    pub pulse_us: Option<u32>,
    pub is_moving: bool,
    /// Last fault reported for the channel, cleared by the next feedback.
    pub error: Option<String>,
    pub reported_by: Option<DeviceId>,
    pub updated_at: DateTime<Utc>,
}

impl ServoChannelState {
    pub fn new(channel: u8, now: DateTime<Utc>) -> Self {
        Self {
            channel,
            target_angle: None,
            current_angle: None,
            pulse_us: None,
            is_moving: false,
            error: None,
            reported_by: None,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_reason_wire_and_display() {
        assert_eq!(
            serde_json::to_string(&OfflineReason::HeartbeatTimeout).unwrap(),
            "\"heartbeat_timeout\""
        );
        assert_eq!(OfflineReason::Disconnected.to_string(), "connection closed");
    }

    #[test]
    fn test_history_event_tagging() {
        let now = Utc::now();
        let event = HistoryEvent::Disconnected {
            device_id: DeviceId::new("wheels"),
            reason: OfflineReason::Disconnected,
            at: now,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "disconnected");
        assert_eq!(value["reason"], "disconnected");
        assert_eq!(event.device_id().as_str(), "wheels");
        assert_eq!(event.at(), now);
        assert!(event.is_connection());

        let snapshot = HistoryEvent::Snapshot {
            device_id: DeviceId::new("head"),
            device_type: DeviceType::new("servo-driver"),
            payload: serde_json::json!({}),
            at: now,
        };
        assert!(!snapshot.is_connection());
    }
}
