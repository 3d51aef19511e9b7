//! Connection registry: which live session currently speaks for a device.
//!
//! At most one session is bound to a device id. A newer registration for
//! the same id replaces the older session and closes it (last writer
//! wins). The lock guards only the map; sends and closes happen after it
//! is released so a slow controller never blocks the rest of the fleet.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use fleet_core::DeviceId;
use fleet_protocol::CoreMessage;

use crate::session::{ConnectionId, Session};

type SessionMap = HashMap<DeviceId, Arc<dyn Session>>;

/// Shared device id → session map. Clones share the same map.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<Mutex<SessionMap>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `session` to `device_id`, closing any session it replaces.
    ///
    /// Returns true if a different session was replaced.
    pub async fn register(&self, device_id: DeviceId, session: Arc<dyn Session>) -> bool {
        let incoming = session.connection_id();
        let previous = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(device_id.clone(), session)
        };

        match previous {
            Some(old) if old.connection_id() != incoming => {
                info!(
                    device_id = %device_id,
                    old = %old.connection_id(),
                    new = %incoming,
                    "Replacing existing session"
                );
                if let Err(e) = old.close().await {
                    debug!(device_id = %device_id, error = %e, "Closing replaced session failed");
                }
                true
            }
            _ => false,
        }
    }

    /// Removes whatever session is bound to `device_id`. No-op if none.
    pub async fn unregister(&self, device_id: &DeviceId) {
        let removed = self.sessions.lock().await.remove(device_id);
        if removed.is_some() {
            debug!(device_id = %device_id, "Session unregistered");
        }
    }

    /// Removes the binding only if it still belongs to `connection_id`.
    ///
    /// Returns false if the device has since been taken over by a newer
    /// session, which is then left untouched.
    pub async fn unregister_session(
        &self,
        device_id: &DeviceId,
        connection_id: ConnectionId,
    ) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(device_id) {
            Some(current) if current.connection_id() == connection_id => {
                sessions.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// Removes and closes the session bound to `device_id`.
    ///
    /// Returns true if there was one.
    pub async fn disconnect(&self, device_id: &DeviceId) -> bool {
        let removed = self.sessions.lock().await.remove(device_id);
        match removed {
            Some(session) => {
                if let Err(e) = session.close().await {
                    debug!(device_id = %device_id, error = %e, "Closing session failed");
                }
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, device_id: &DeviceId) -> bool {
        self.sessions.lock().await.contains_key(device_id)
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Sends one message to the device's current session.
    ///
    /// Returns false if no session is bound or the send failed. A failed
    /// session is closed and dropped from the map unless it was replaced
    /// meanwhile. Never retries.
    pub async fn send(&self, device_id: &DeviceId, message: &CoreMessage) -> bool {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(device_id).cloned()
        };

        let Some(session) = session else {
            debug!(device_id = %device_id, "No active session");
            return false;
        };

        match session.send(message).await {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    device_id = %device_id,
                    connection = %session.connection_id(),
                    error = %e,
                    "Send failed, dropping session"
                );
                self.unregister_session(device_id, session.connection_id())
                    .await;
                if let Err(e) = session.close().await {
                    debug!(device_id = %device_id, error = %e, "Close of dropped session failed");
                }
                false
            }
        }
    }
}
