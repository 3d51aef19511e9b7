//! Registry actor - owns every device record and processes commands.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Responder send failures are ignored (the caller went away)
//! - Event publish failures are ignored (no subscribers)

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use fleet_core::{Device, DeviceId, DeviceType, Metadata, OfflineReason};

use super::commands::{DeviceEvent, RegistryCommand, RegistryError};

/// Maximum number of distinct devices the registry will track.
pub const MAX_DEVICES: usize = 256;

/// Single owner of device state.
///
/// Commands are handled sequentially in one task, so every mutation
/// (including the heartbeat sweep) is serialized against every other.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    devices: HashMap<DeviceId, Device>,
    event_publisher: broadcast::Sender<DeviceEvent>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<DeviceEvent>,
    ) -> Self {
        Self {
            receiver,
            devices: HashMap::new(),
            event_publisher,
        }
    }

    /// Processes commands until every handle has been dropped.
    pub async fn run(mut self) {
        info!("Device registry starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(devices = self.devices.len(), "Device registry stopped");
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::RegisterOrRefresh {
                device_id,
                device_type,
                metadata,
                respond_to,
            } => {
                let result = self.handle_register(device_id, device_type, metadata, Utc::now());
                let _ = respond_to.send(result);
            }
            RegistryCommand::MarkOnline {
                device_id,
                respond_to,
            } => {
                let known = self.handle_mark_online(&device_id, Utc::now());
                let _ = respond_to.send(known);
            }
            RegistryCommand::MarkOffline {
                device_id,
                reason,
                respond_to,
            } => {
                let transitioned = self.handle_mark_offline(&device_id, reason);
                let _ = respond_to.send(transitioned);
            }
            RegistryCommand::GetDevice {
                device_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.devices.get(&device_id).cloned());
            }
            RegistryCommand::ListAll { respond_to } => {
                let mut devices: Vec<Device> = self.devices.values().cloned().collect();
                devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
                let _ = respond_to.send(devices);
            }
            RegistryCommand::ListOnlineByType {
                device_type,
                respond_to,
            } => {
                let _ = respond_to.send(self.online_by_type(&device_type));
            }
            RegistryCommand::SweepStale {
                now,
                timeout,
                respond_to,
            } => {
                let demoted = self.handle_sweep_stale(now, timeout);
                let _ = respond_to.send(demoted);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    fn handle_register(
        &mut self,
        device_id: DeviceId,
        device_type: DeviceType,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Result<Device, RegistryError> {
        if device_id.is_blank() {
            return Err(RegistryError::BlankDeviceId);
        }

        if let Some(device) = self.devices.get_mut(&device_id) {
            let was_offline = !device.is_online;
            let previous_type = device.device_type.clone();
            if device.refresh(device_type, now) {
                info!(
                    device_id = %device_id,
                    from = %previous_type,
                    to = %device.device_type,
                    "Device changed type on re-registration"
                );
            }
            device.merge_metadata(metadata);
            let snapshot = device.clone();

            if was_offline {
                self.publish(DeviceEvent::Online { device_id });
            }
            return Ok(snapshot);
        }

        if self.devices.len() >= MAX_DEVICES {
            warn!(
                device_id = %device_id,
                max = MAX_DEVICES,
                "Registry full, refusing new device"
            );
            return Err(RegistryError::RegistryFull { max: MAX_DEVICES });
        }

        let mut device = Device::registered(device_id.clone(), device_type.clone(), now);
        device.merge_metadata(metadata);
        self.devices.insert(device_id.clone(), device.clone());

        debug!(device_id = %device_id, device_type = %device_type, "Device created");
        self.publish(DeviceEvent::Registered {
            device_id,
            device_type,
        });

        Ok(device)
    }

    fn handle_mark_online(&mut self, device_id: &DeviceId, now: DateTime<Utc>) -> bool {
        let Some(device) = self.devices.get_mut(device_id) else {
            debug!(device_id = %device_id, "Heartbeat for unknown device ignored");
            return false;
        };

        if device.touch(now) {
            info!(device_id = %device_id, "Device back online");
            self.publish(DeviceEvent::Online {
                device_id: device_id.clone(),
            });
        }
        true
    }

    fn handle_mark_offline(&mut self, device_id: &DeviceId, reason: OfflineReason) -> bool {
        let transitioned = self
            .devices
            .get_mut(device_id)
            .map(Device::mark_offline)
            .unwrap_or(false);

        if transitioned {
            self.publish(DeviceEvent::Offline {
                device_id: device_id.clone(),
                reason,
            });
        }
        transitioned
    }

    fn handle_sweep_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<DeviceId> {
        let mut demoted = Vec::new();

        for device in self.devices.values_mut() {
            if device.is_stale(now, timeout) {
                device.mark_offline();
                demoted.push(device.device_id.clone());
            }
        }

        for device_id in &demoted {
            self.publish(DeviceEvent::Offline {
                device_id: device_id.clone(),
                reason: OfflineReason::HeartbeatTimeout,
            });
        }

        demoted
    }

    fn online_by_type(&self, device_type: &DeviceType) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .values()
            .filter(|d| d.is_online && &d.device_type == device_type)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    fn publish(&self, event: DeviceEvent) {
        // No subscribers is not an error
        let _ = self.event_publisher.send(event);
    }
}
