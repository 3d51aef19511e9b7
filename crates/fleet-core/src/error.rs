//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors raised by static actuation configuration.
///
/// These are never clamped away: an unknown channel or an invalid bound is a
/// deployment mistake and must surface at startup or at the offending call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// Channel has no servo configuration
    #[error("Servo channel {channel} is not configured")]
    UnknownChannel { channel: u8 },

    /// Channel number outside the driver's addressable range
    #[error("Servo channel {channel} out of range (max {max})")]
    ChannelOutOfRange { channel: u8, max: u8 },

    /// Bounds violate an ordering or range invariant
    #[error("Invalid servo bounds on channel {channel}: {reason}")]
    InvalidBounds { channel: u8, reason: String },

    /// Same channel configured twice
    #[error("Servo channel {channel} configured more than once")]
    DuplicateChannel { channel: u8 },
}
