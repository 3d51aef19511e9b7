//! Event history collaborator.
//!
//! The core reports connection changes, routed commands, acknowledgements
//! and status snapshots to a [`HistorySink`]. Nothing in the core waits on
//! the sink for correctness: implementations swallow their own failures.
//!
//! Two sinks ship with the daemon:
//! - [`TracingHistory`] writes each event as a structured log line
//! - [`MemoryHistory`] keeps a bounded in-memory ledger for inspection
//!
//! [`HistoryFanout`] combines several sinks.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_core::{Command, CommandId, CommandStatus, Device, DeviceId, DeviceType};

use crate::registry::{DeviceEvent, RegistryHandle};

pub use fleet_core::{CommandRecord, HistoryEvent, OfflineReason};

/// Default number of entries kept by [`MemoryHistory`].
pub const DEFAULT_HISTORY_CAPACITY: usize = 2000;

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn device_connected(&self, device: &Device);

    async fn device_disconnected(&self, device_id: &DeviceId, reason: OfflineReason);

    /// A command left the router, with the number of sessions it reached.
    async fn command_routed(&self, command: &Command, target_count: usize);

    /// A device of `device_type` reported the outcome of a command.
    async fn command_acknowledged(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        command_id: &CommandId,
        status: CommandStatus,
    );

    async fn state_snapshot(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        payload: &serde_json::Value,
    );
}

// ============================================================================
// Tracing sink
// ============================================================================

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHistory;

#[async_trait]
impl HistorySink for TracingHistory {
    async fn device_connected(&self, device: &Device) {
        info!(
            target: "fleetd::history",
            device_id = %device.device_id,
            device_type = %device.device_type,
            "device connected"
        );
    }

    async fn device_disconnected(&self, device_id: &DeviceId, reason: OfflineReason) {
        info!(
            target: "fleetd::history",
            device_id = %device_id,
            reason = %reason,
            "device disconnected"
        );
    }

    async fn command_routed(&self, command: &Command, target_count: usize) {
        info!(
            target: "fleetd::history",
            command_id = %command.command_id,
            device_type = %command.device_type,
            command = %command.command_name,
            status = %command.status(),
            targets = target_count,
            "command routed"
        );
    }

    async fn command_acknowledged(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        command_id: &CommandId,
        status: CommandStatus,
    ) {
        info!(
            target: "fleetd::history",
            device_id = %device_id,
            device_type = %device_type,
            command_id = %command_id,
            status = %status,
            "command acknowledged"
        );
    }

    async fn state_snapshot(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        payload: &serde_json::Value,
    ) {
        debug!(
            target: "fleetd::history",
            device_id = %device_id,
            device_type = %device_type,
            payload = %payload,
            "state snapshot"
        );
    }
}

// ============================================================================
// Memory sink
// ============================================================================

#[derive(Default)]
struct Ledger {
    events: VecDeque<HistoryEvent>,
    commands: VecDeque<CommandRecord>,
}

/// Bounded in-memory history. Oldest entries are evicted first.
pub struct MemoryHistory {
    capacity: usize,
    ledger: Mutex<Ledger>,
}

impl Default for MemoryHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl MemoryHistory {
    /// Creates a ledger holding at most `capacity` events and `capacity` commands.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub async fn events(&self) -> Vec<HistoryEvent> {
        self.ledger.lock().await.events.iter().cloned().collect()
    }

    /// Routed commands, oldest first.
    pub async fn commands(&self) -> Vec<CommandRecord> {
        self.ledger.lock().await.commands.iter().cloned().collect()
    }

    pub async fn command(&self, command_id: &CommandId) -> Option<CommandRecord> {
        let ledger = self.ledger.lock().await;
        ledger
            .commands
            .iter()
            .find(|r| &r.command.command_id == command_id)
            .cloned()
    }

    /// The newest `limit` commands matching the filters, oldest first.
    pub async fn recent_commands(
        &self,
        device_type: Option<&DeviceType>,
        status: Option<CommandStatus>,
        limit: usize,
    ) -> Vec<CommandRecord> {
        let ledger = self.ledger.lock().await;
        let mut records: Vec<CommandRecord> = ledger
            .commands
            .iter()
            .rev()
            .filter(|r| device_type.map_or(true, |t| &r.command.device_type == t))
            .filter(|r| status.map_or(true, |s| r.status() == s))
            .take(limit)
            .cloned()
            .collect();
        records.reverse();
        records
    }

    /// The newest `limit` connect/disconnect events of one device, oldest first.
    pub async fn connection_history(
        &self,
        device_id: &DeviceId,
        limit: usize,
    ) -> Vec<HistoryEvent> {
        self.device_events(device_id, limit, HistoryEvent::is_connection)
            .await
    }

    /// The newest `limit` status snapshots of one device, oldest first.
    pub async fn state_history(&self, device_id: &DeviceId, limit: usize) -> Vec<HistoryEvent> {
        self.device_events(device_id, limit, |e| !e.is_connection())
            .await
    }

    async fn device_events(
        &self,
        device_id: &DeviceId,
        limit: usize,
        keep: impl Fn(&HistoryEvent) -> bool,
    ) -> Vec<HistoryEvent> {
        let ledger = self.ledger.lock().await;
        let mut events: Vec<HistoryEvent> = ledger
            .events
            .iter()
            .rev()
            .filter(|e| e.device_id() == device_id && keep(*e))
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    async fn push_event(&self, event: HistoryEvent) {
        let mut ledger = self.ledger.lock().await;
        if ledger.events.len() >= self.capacity {
            ledger.events.pop_front();
        }
        ledger.events.push_back(event);
    }
}

#[async_trait]
impl HistorySink for MemoryHistory {
    async fn device_connected(&self, device: &Device) {
        self.push_event(HistoryEvent::Connected {
            device_id: device.device_id.clone(),
            device_type: device.device_type.clone(),
            at: Utc::now(),
        })
        .await;
    }

    async fn device_disconnected(&self, device_id: &DeviceId, reason: OfflineReason) {
        self.push_event(HistoryEvent::Disconnected {
            device_id: device_id.clone(),
            reason,
            at: Utc::now(),
        })
        .await;
    }

    async fn command_routed(&self, command: &Command, target_count: usize) {
        let mut ledger = self.ledger.lock().await;
        if ledger.commands.len() >= self.capacity {
            ledger.commands.pop_front();
        }
        ledger.commands.push_back(CommandRecord {
            command: command.clone(),
            target_count,
            acknowledged_by: None,
        });
    }

    async fn command_acknowledged(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        command_id: &CommandId,
        status: CommandStatus,
    ) {
        let mut ledger = self.ledger.lock().await;
        let Some(record) = ledger
            .commands
            .iter_mut()
            .find(|r| &r.command.command_id == command_id)
        else {
            debug!(command_id = %command_id, "Ack for unknown or evicted command");
            return;
        };

        if &record.command.device_type != device_type {
            warn!(
                command_id = %command_id,
                device_id = %device_id,
                device_type = %device_type,
                target_type = %record.command.device_type,
                "Ignoring ack from a device the command was not routed to"
            );
            return;
        }

        if record.command.advance(status) {
            record.acknowledged_by = Some(device_id.clone());
        } else {
            debug!(
                command_id = %command_id,
                from = %record.command.status(),
                to = %status,
                "Ignoring ack that would move status backwards"
            );
        }
    }

    async fn state_snapshot(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        payload: &serde_json::Value,
    ) {
        self.push_event(HistoryEvent::Snapshot {
            device_id: device_id.clone(),
            device_type: device_type.clone(),
            payload: payload.clone(),
            at: Utc::now(),
        })
        .await;
    }
}

// ============================================================================
// Fan-out
// ============================================================================

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct HistoryFanout {
    sinks: Vec<Arc<dyn HistorySink>>,
}

impl HistoryFanout {
    pub fn new(sinks: Vec<Arc<dyn HistorySink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl HistorySink for HistoryFanout {
    async fn device_connected(&self, device: &Device) {
        for sink in &self.sinks {
            sink.device_connected(device).await;
        }
    }

    async fn device_disconnected(&self, device_id: &DeviceId, reason: OfflineReason) {
        for sink in &self.sinks {
            sink.device_disconnected(device_id, reason).await;
        }
    }

    async fn command_routed(&self, command: &Command, target_count: usize) {
        for sink in &self.sinks {
            sink.command_routed(command, target_count).await;
        }
    }

    async fn command_acknowledged(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        command_id: &CommandId,
        status: CommandStatus,
    ) {
        for sink in &self.sinks {
            sink.command_acknowledged(device_id, device_type, command_id, status)
                .await;
        }
    }

    async fn state_snapshot(
        &self,
        device_id: &DeviceId,
        device_type: &DeviceType,
        payload: &serde_json::Value,
    ) {
        for sink in &self.sinks {
            sink.state_snapshot(device_id, device_type, payload).await;
        }
    }
}

// ============================================================================
// Forwarder
// ============================================================================

/// Relays heartbeat-timeout demotions from the registry to `sink`.
///
/// Disconnects observed by a connection handler are reported by the
/// handler itself, so only timeouts are forwarded here.
pub fn spawn_history_forwarder(
    registry: &RegistryHandle,
    sink: Arc<dyn HistorySink>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    let mut events = registry.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("History forwarder shutting down");
                    break;
                }

                result = events.recv() => match result {
                    Ok(DeviceEvent::Offline {
                        device_id,
                        reason: OfflineReason::HeartbeatTimeout,
                    }) => {
                        sink.device_disconnected(&device_id, OfflineReason::HeartbeatTimeout)
                            .await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "History forwarder lagged, skipped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Registry event channel closed");
                        break;
                    }
                }
            }
        }
    })
}
