//! Client interface for the device registry actor.
//!
//! # Panic-Free Guarantees
//!
//! Channel errors map to `RegistryError::ChannelClosed` for calls that
//! return a `Result`, and to an empty/negative answer for queries.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};

use fleet_core::{Device, DeviceId, DeviceType, Metadata, OfflineReason};

use super::commands::{DeviceEvent, RegistryCommand, RegistryError};

/// Cheap-to-clone handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<DeviceEvent>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Creates the device on first sight, refreshes it afterwards.
    ///
    /// A refresh marks the device online, bumps its heartbeat, adopts a
    /// changed device type and merges `metadata` into the stored map.
    ///
    /// # Errors
    ///
    /// - `RegistryError::BlankDeviceId` for an empty id
    /// - `RegistryError::RegistryFull` if a new device would exceed capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register_or_refresh(
        &self,
        device_id: DeviceId,
        device_type: DeviceType,
        metadata: Metadata,
    ) -> Result<Device, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::RegisterOrRefresh {
                device_id,
                device_type,
                metadata,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Records a heartbeat. Returns false for unknown devices.
    pub async fn mark_online(&self, device_id: DeviceId) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::MarkOnline {
                device_id,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    /// Marks a device offline. Returns true if it was online.
    pub async fn mark_offline(&self, device_id: DeviceId, reason: OfflineReason) -> bool {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::MarkOffline {
                device_id,
                reason,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        rx.await.unwrap_or(false)
    }

    pub async fn get(&self, device_id: DeviceId) -> Option<Device> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::GetDevice {
                device_id,
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok().flatten()
    }

    /// Every known device, online or not, ordered by id.
    pub async fn list_all(&self) -> Vec<Device> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::ListAll { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Online devices of one type, ordered by id.
    pub async fn list_online_by_type(&self, device_type: DeviceType) -> Vec<Device> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::ListOnlineByType {
                device_type,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Demotes devices silent for longer than `timeout` as of `now`.
    ///
    /// Returns the ids that transitioned to offline during this sweep.
    pub async fn sweep_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<DeviceId> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::SweepStale {
                now,
                timeout,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Subscribes to liveness events. Does not talk to the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_sender.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
