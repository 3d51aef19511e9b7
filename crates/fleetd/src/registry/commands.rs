//! Command and event types for the device registry actor.
//!
//! Commands carry a oneshot `respond_to` channel when the caller needs an
//! answer. Events go out on a broadcast channel to anyone interested in
//! liveness changes (the history forwarder, operator tooling).

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::oneshot;

use fleet_core::{Device, DeviceId, DeviceType, Metadata, OfflineReason};

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands processed by the registry actor, one at a time.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Create a device or refresh an existing one from a registration.
    RegisterOrRefresh {
        device_id: DeviceId,
        device_type: DeviceType,
        metadata: Metadata,
        respond_to: oneshot::Sender<Result<Device, RegistryError>>,
    },

    /// Record a heartbeat. Answers whether the device is known.
    MarkOnline {
        device_id: DeviceId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Mark a device offline. Answers whether it transitioned.
    MarkOffline {
        device_id: DeviceId,
        reason: OfflineReason,
        respond_to: oneshot::Sender<bool>,
    },

    GetDevice {
        device_id: DeviceId,
        respond_to: oneshot::Sender<Option<Device>>,
    },

    ListAll {
        respond_to: oneshot::Sender<Vec<Device>>,
    },

    ListOnlineByType {
        device_type: DeviceType,
        respond_to: oneshot::Sender<Vec<Device>>,
    },

    /// Mark every online device silent for longer than `timeout` as offline.
    ///
    /// Answers with the ids that were demoted by this sweep.
    SweepStale {
        now: DateTime<Utc>,
        timeout: Duration,
        respond_to: oneshot::Sender<Vec<DeviceId>>,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("registry is full (max: {max} devices)")]
    RegistryFull { max: usize },

    #[error("invalid device id: must not be blank")]
    BlankDeviceId,

    /// The actor has shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Device Events
// ============================================================================

/// Liveness changes published by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// First registration of a device id.
    Registered {
        device_id: DeviceId,
        device_type: DeviceType,
    },

    /// A known device came back online (re-registration or heartbeat after
    /// being offline).
    Online { device_id: DeviceId },

    Offline {
        device_id: DeviceId,
        reason: OfflineReason,
    },
}
