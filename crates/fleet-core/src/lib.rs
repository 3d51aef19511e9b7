//! Fleet Core - Shared types for the robot fleet control plane
//!
//! This crate provides the domain types shared between the daemon
//! (fleetd), the wire protocol and operator tooling.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod command;
pub mod device;
pub mod error;
pub mod record;
pub mod servo;

// Re-exports for convenience
pub use command::{Command, CommandClass, CommandId, CommandStatus};
pub use device::{Device, DeviceId, DeviceType, Metadata};
pub use error::ConfigurationError;
pub use record::{CommandRecord, DeviceState, HistoryEvent, OfflineReason, ServoChannelState};
pub use servo::{
    pulse_to_ticks, ActuationModel, PwmProfile, ServoConfig, ServoFault, ServoFeedback,
    ServoReading,
};
