//! Heartbeat monitor for the fleet daemon.
//!
//! Periodically demotes controllers that went silent without closing their
//! connection (power loss, Wi-Fi drop) and force-closes their sessions.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Shutdown is cooperative via `CancellationToken`, checked between sweeps;
//!   a sweep already running finishes closing its sessions

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fleet_core::DeviceId;

use crate::connections::ConnectionRegistry;
use crate::registry::RegistryHandle;

/// How often the monitor sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Silence after which an online device is considered gone.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub sweep_interval: Duration,
    pub timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

pub struct HeartbeatMonitor {
    registry: RegistryHandle,
    connections: ConnectionRegistry,
    config: MonitorConfig,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: RegistryHandle,
        connections: ConnectionRegistry,
        config: MonitorConfig,
    ) -> Self {
        Self {
            registry,
            connections,
            config,
        }
    }

    pub fn config(&self) -> MonitorConfig {
        self.config
    }

    /// Runs one sweep as of `now`.
    ///
    /// Devices that never sent a heartbeat are skipped. Returns the ids
    /// demoted by this sweep, whose sessions have been closed.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Vec<DeviceId> {
        let timeout = chrono::Duration::from_std(self.config.timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));

        let demoted = self.registry.sweep_stale(now, timeout).await;

        for device_id in &demoted {
            info!(
                device_id = %device_id,
                timeout_secs = self.config.timeout.as_secs(),
                "Heartbeat timeout, marking device offline"
            );
            if self.connections.disconnect(device_id).await {
                debug!(device_id = %device_id, "Closed session of silent device");
            }
        }

        demoted
    }

    /// Spawns the sweep loop. The first sweep happens one interval after start.
    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.sweep_interval;
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_secs = period.as_secs(),
                timeout_secs = self.config.timeout.as_secs(),
                "Heartbeat monitor started"
            );

            loop {
                tokio::select! {
                    biased;

                    _ = cancel_token.cancelled() => {
                        info!("Heartbeat monitor shutting down");
                        break;
                    }

                    _ = tick.tick() => {
                        let demoted = self.sweep_once(Utc::now()).await;
                        if !demoted.is_empty() {
                            debug!(count = demoted.len(), "Sweep demoted devices");
                        }
                    }
                }
            }

            debug!("Heartbeat monitor task completed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::spawn_registry;
    use crate::session::{ConnectionId, Session, TransportError};
    use async_trait::async_trait;
    use fleet_core::{DeviceType, Metadata};
    use fleet_protocol::CoreMessage;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// Session whose close blocks until the test releases it.
    struct GatedSession {
        id: ConnectionId,
        entered: Notify,
        release: Notify,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Session for GatedSession {
        fn connection_id(&self) -> ConnectionId {
            self.id
        }

        async fn send(&self, _message: &CoreMessage) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn register_wheels(registry: &RegistryHandle) {
        registry
            .register_or_refresh(
                DeviceId::new("wheels"),
                DeviceType::new("wheel-driver"),
                Metadata::new(),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_sweep_once_demotes_silent_devices() {
        let registry = spawn_registry();
        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            ConnectionRegistry::new(),
            MonitorConfig::default(),
        );
        register_wheels(&registry).await;

        assert!(monitor.sweep_once(Utc::now()).await.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(100);
        assert_eq!(monitor.sweep_once(later).await, vec![DeviceId::new("wheels")]);

        let device = registry.get(DeviceId::new("wheels")).await.unwrap();
        assert!(!device.is_online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_stops_on_cancel() {
        let registry = spawn_registry();
        let monitor =
            HeartbeatMonitor::new(registry, ConnectionRegistry::new(), MonitorConfig::default());
        let cancel = CancellationToken::new();
        let task = monitor.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        assert!(task.await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_mid_sweep_finishes_closing_sessions() {
        let registry = spawn_registry();
        let connections = ConnectionRegistry::new();
        let wheels = DeviceId::new("wheels");
        let session = Arc::new(GatedSession {
            id: ConnectionId::next(),
            entered: Notify::new(),
            release: Notify::new(),
            closed: AtomicBool::new(false),
        });

        register_wheels(&registry).await;
        connections.register(wheels.clone(), session.clone()).await;
        std::thread::sleep(Duration::from_millis(5));

        let config = MonitorConfig {
            sweep_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(1),
        };
        let cancel = CancellationToken::new();
        let task = HeartbeatMonitor::new(registry.clone(), connections.clone(), config)
            .spawn(cancel.clone());

        tokio::time::timeout(Duration::from_secs(2), session.entered.notified())
            .await
            .expect("sweep reached the session close");
        cancel.cancel();
        session.release.notify_one();
        task.await.unwrap();

        assert!(session.closed.load(Ordering::SeqCst));
        assert!(!connections.is_active(&wheels).await);
        assert!(!registry.get(wheels).await.unwrap().is_online);
    }
}
