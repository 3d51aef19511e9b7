//! Routed commands and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::DeviceType;

// ============================================================================
// Command Identifier
// ============================================================================

/// Globally unique command identifier (UUID v4 string).
///
/// Echoed back by devices in `command_ack` messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Command Status
// ============================================================================

/// Lifecycle status of a routed command.
///
/// ```text
///             ┌──────────▶ sent ──────┬──▶ ack_success
///             │                       └──▶ ack_error
/// pending ────┼──────────▶ no_devices
///             └──────────▶ rejected_system_locked
/// ```
///
/// Status only moves forward along these edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    #[default]
    Pending,
    Sent,
    NoDevices,
    RejectedSystemLocked,
    AckSuccess,
    AckError,
}

impl CommandStatus {
    /// Returns true if `next` is a legal successor of this status.
    #[must_use]
    pub fn can_advance_to(self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, NoDevices)
                | (Pending, RejectedSystemLocked)
                | (Sent, AckSuccess)
                | (Sent, AckError)
        )
    }

    /// Returns true if no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Sent)
    }

    /// Maps the `status` field of a device acknowledgement.
    ///
    /// Firmware reports `"success"`; anything else counts as a failure.
    pub fn from_ack(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "success" | "ok" => Self::AckSuccess,
            _ => Self::AckError,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::NoDevices => "no_devices",
            Self::RejectedSystemLocked => "rejected_system_locked",
            Self::AckSuccess => "ack_success",
            Self::AckError => "ack_error",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Command
// ============================================================================

/// A request to run `command_name` on every online device of `device_type`.
///
/// Immutable apart from `status`, which is advanced through
/// [`Command::advance`] only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: CommandId,
    pub device_type: DeviceType,
    pub command_name: String,
    pub payload: serde_json::Value,
    status: CommandStatus,
    pub created_at: DateTime<Utc>,
}

impl Command {
    /// Creates a pending command with a fresh identifier.
    pub fn new(
        device_type: DeviceType,
        command_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            command_id: CommandId::generate(),
            device_type,
            command_name: command_name.into(),
            payload,
            status: CommandStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn status(&self) -> CommandStatus {
        self.status
    }

    /// Moves to `next` if the transition is legal.
    ///
    /// Returns false and leaves the status untouched otherwise.
    pub fn advance(&mut self, next: CommandStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Interlock Classification
// ============================================================================

/// How a command name interacts with the safety interlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    /// Drives the wheels; refused while the interlock is held.
    WheelMovement,
    /// Pose change that must not overlap wheel motion; takes the interlock.
    ExclusiveActuation,
    /// Ignores the interlock.
    Unrestricted,
}

const WHEEL_MOVEMENT: &[&str] = &[
    "forward",
    "backward",
    "left",
    "right",
    "moveforward",
    "movebackward",
    "turnleft",
    "turnright",
];

const EXCLUSIVE_ACTUATION: &[&str] = &["resetposition", "handsup", "headup", "headleft"];

impl CommandClass {
    /// Classifies a command name.
    ///
    /// Matching ignores case and `_`, `-` and whitespace separators, so
    /// `MOVE_FORWARD`, `move-forward` and `forward` are all wheel movement.
    pub fn classify(command_name: &str) -> Self {
        let canonical = canonical_name(command_name);
        if WHEEL_MOVEMENT.contains(&canonical.as_str()) {
            Self::WheelMovement
        } else if EXCLUSIVE_ACTUATION.contains(&canonical.as_str()) {
            Self::ExclusiveActuation
        } else {
            Self::Unrestricted
        }
    }
}

fn canonical_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-') && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}
