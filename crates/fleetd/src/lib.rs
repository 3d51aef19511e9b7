//! fleetd - Robot fleet control plane library
//!
//! This crate provides the daemon components used by the `fleetd` binary:
//! the device registry, the connection registry, the controller gateway,
//! the heartbeat monitor and the command router with its safety interlock.
//!
//! # Architecture
//!
//! ```text
//!  controllers (TCP, JSON lines)            operator tools (Unix socket)
//!            │                                          │
//!            ▼                                          ▼
//!   ┌─────────────────┐                       ┌──────────────────┐
//!   │  GatewayServer  │                       │  ControlServer   │
//!   └────────┬────────┘                       └────────┬─────────┘
//!            │ per connection                          │
//!            ▼                                         ▼
//!   ┌─────────────────┐   sessions   ┌──────────────────────────────┐
//!   │ConnectionHandler│─────────────▶│ ConnectionRegistry           │◀──┐
//!   └────────┬────────┘              └──────────────────────────────┘   │ send
//!            │ register/heartbeat    ┌──────────────────────────────┐   │
//!            └──────────────────────▶│ RegistryActor (devices)      │◀──┤ list online
//!                                    └──────────────────────────────┘   │
//!   ┌─────────────────┐   sweep                 ▲              ┌────────┴───────┐
//!   │HeartbeatMonitor │─────────────────────────┘              │ CommandRouter  │
//!   └─────────────────┘                                        │  + Interlock   │
//!                                                              └────────────────┘
//! ```
//!
//! All shared state is owned by a registry and reached through cheap,
//! cloneable handles. Nothing is global; the binary constructs each
//! component and injects it where needed.

pub mod config;
pub mod connections;
pub mod history;
pub mod monitor;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod state;

pub use config::{ConfigError, FleetConfig};
pub use connections::ConnectionRegistry;
pub use history::{HistoryFanout, HistorySink, MemoryHistory, TracingHistory};
pub use monitor::{HeartbeatMonitor, MonitorConfig};
pub use registry::{spawn_registry, RegistryHandle};
pub use router::{CommandRouter, RouteError, RouterConfig};
pub use server::{ControlServer, GatewayConfig, GatewayContext, GatewayServer};
pub use session::{ConnectionId, LineSession, Session, TransportError};
pub use state::{StateManager, StateStore};
