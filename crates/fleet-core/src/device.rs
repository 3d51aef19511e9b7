//! Device identity and liveness state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique, reconnect-stable identifier of a physical controller.
///
/// Chosen by the firmware (e.g. "servoscontroller") and sent in the
/// registration message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the identifier is empty or whitespace only.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Group label used to address commands to a class of controllers.
///
/// Several devices may share one type; commands routed to a type fan out
/// to every online member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceType(String);

impl DeviceType {
    /// Conventional type of the wheel (mobility) driver.
    pub const WHEEL_DRIVER: &'static str = "wheel-driver";

    /// Conventional type of the servo/head driver.
    pub const SERVO_DRIVER: &'static str = "servo-driver";

    pub fn new(device_type: impl Into<String>) -> Self {
        Self(device_type.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for DeviceType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque key/value metadata reported by a device at registration.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Device
// ============================================================================

/// Identity and liveness of a single controller.
///
/// Records are created on first registration and never removed; a device
/// that goes away is only marked offline so its history stays addressable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    pub is_online: bool,
    /// Last registration, heartbeat or pong. `None` until first contact.
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Device {
    /// Creates an online device from its first registration.
    pub fn registered(device_id: DeviceId, device_type: DeviceType, now: DateTime<Utc>) -> Self {
        Self {
            device_id,
            device_type,
            is_online: true,
            last_heartbeat: Some(now),
            connected_at: Some(now),
            metadata: Metadata::new(),
        }
    }

    /// Applies a repeated registration.
    ///
    /// Marks online, bumps the heartbeat and adopts a changed device type.
    /// `connected_at` keeps the first registration time.
    /// Returns true if the device type changed.
    pub fn refresh(&mut self, device_type: DeviceType, now: DateTime<Utc>) -> bool {
        let type_changed = self.device_type != device_type;
        if type_changed {
            self.device_type = device_type;
        }
        if self.connected_at.is_none() {
            self.connected_at = Some(now);
        }
        self.is_online = true;
        self.last_heartbeat = Some(now);
        type_changed
    }

    /// Merges reported metadata into the stored map (later keys win).
    pub fn merge_metadata(&mut self, metadata: Metadata) {
        self.metadata.extend(metadata);
    }

    /// Records a heartbeat. Returns true if the device was offline.
    pub fn touch(&mut self, now: DateTime<Utc>) -> bool {
        let was_offline = !self.is_online;
        self.is_online = true;
        self.last_heartbeat = Some(now);
        was_offline
    }

    /// Marks the device offline. Returns true if it was online.
    pub fn mark_offline(&mut self) -> bool {
        let was_online = self.is_online;
        self.is_online = false;
        was_online
    }

    /// Time since the last heartbeat, `None` if never heard from.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_heartbeat.map(|seen| now - seen)
    }

    /// Returns true if the device is online but silent for longer than `timeout`.
    ///
    /// Devices that never sent a heartbeat are never stale.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.is_online
            && self
                .heartbeat_age(now)
                .map(|age| age > timeout)
                .unwrap_or(false)
    }
}
