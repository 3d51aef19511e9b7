//! Wheel/pose safety interlock.
//!
//! Plain state machine with no I/O; the router owns one behind a mutex and
//! performs the lock/unlock broadcasts itself.
//!
//! ```text
//!             exclusive command (epoch += 1, deadline = now + grace)
//!   UNLOCKED ─────────────────────────────────────────────────────▶ LOCKED
//!      ▲                                                             │  ▲
//!      │            release(epoch) with epoch == current             │  │ exclusive command
//!      └─────────────────────────────────────────────────────────────┘  │ (epoch += 1, new deadline)
//!                                                                    └──┘
//! ```

use std::time::Duration;

use tokio::time::Instant;

use fleet_core::CommandClass;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interlock {
    locked: bool,
    epoch: u64,
    deadline: Option<Instant>,
}

impl Interlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// When the current lock window is due to end, if locked.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Opens (or restarts) the lock window and returns its epoch.
    ///
    /// Only a release carrying this epoch can end the window; releases
    /// scheduled for earlier windows become no-ops.
    pub fn engage(&mut self, now: Instant, grace: Duration) -> u64 {
        self.epoch = self.epoch.wrapping_add(1);
        self.locked = true;
        self.deadline = Some(now + grace);
        self.epoch
    }

    /// Ends the window opened at `epoch`. Returns true if this unlocked.
    pub fn release(&mut self, epoch: u64) -> bool {
        if !self.locked || epoch != self.epoch {
            return false;
        }
        self.locked = false;
        self.deadline = None;
        true
    }

    /// Whether a command of this class may be dispatched right now.
    pub fn admits(&self, class: CommandClass) -> bool {
        !(self.locked && class == CommandClass::WheelMovement)
    }
}
