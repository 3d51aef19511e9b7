//! Registration debounce.
//!
//! Flaky controllers sometimes open several connections in quick
//! succession. Only the first registration for an id inside the window is
//! admitted; the others are refused outright.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use fleet_core::DeviceId;

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Map size at which expired entries are pruned.
const PRUNE_THRESHOLD: usize = 512;

pub struct RegistrationDebouncer {
    window: Duration,
    last_admitted: Mutex<HashMap<DeviceId, Instant>>,
}

impl RegistrationDebouncer {
    /// A zero window admits every attempt.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_admitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true if the attempt is admitted, recording it.
    pub async fn admit(&self, device_id: &DeviceId) -> bool {
        if self.window.is_zero() {
            return true;
        }

        let now = Instant::now();
        let mut last = self.last_admitted.lock().await;

        if let Some(previous) = last.get(device_id) {
            if now.duration_since(*previous) < self.window {
                return false;
            }
        }

        if last.len() >= PRUNE_THRESHOLD {
            let window = self.window;
            last.retain(|_, seen| now.duration_since(*seen) < window);
        }

        last.insert(device_id.clone(), now);
        true
    }
}

impl Default for RegistrationDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}
