//! Device registry using the actor pattern.
//!
//! The registry is the authoritative record of every controller that has
//! ever registered and whether it is currently reachable.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐                  ┌─────────────────┐     ┌───────────────────┐
//! │ Gateway handlers │ RegistryCommand  │  RegistryActor  │     │ Broadcast channel │
//! │ Heartbeat monitor│─────────────────▶│ HashMap<Device  │────▶│   DeviceEvent     │
//! │ Command router   │  (mpsc channel)  │   Id, Device>   │     │                   │
//! └──────────────────┘                  └─────────────────┘     └───────────────────┘
//! ```
//!
//! The actor never holds transport handles; sessions live in
//! [`crate::connections::ConnectionRegistry`].

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::{RegistryActor, MAX_DEVICES};
pub use commands::{DeviceEvent, RegistryCommand, RegistryError};
pub use fleet_core::OfflineReason;
pub use handle::RegistryHandle;

const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawns the registry actor and returns a handle to it.
///
/// The actor stops once every handle has been dropped.
///
/// ```no_run
/// use fleetd::registry::spawn_registry;
///
/// #[tokio::main]
/// async fn main() {
///     let registry = spawn_registry();
///     let devices = registry.list_all().await;
///     assert!(devices.is_empty());
/// }
/// ```
pub fn spawn_registry() -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, event_tx.clone());
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}
