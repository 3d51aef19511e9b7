//! Fleet Protocol - Wire protocol for controller sessions
//!
//! This crate provides the message envelope exchanged with embedded
//! controllers over their persistent connection, and the request/response
//! types of the fleetd operator control socket.

pub mod control;
pub mod message;
pub mod parse;

pub use control::{ControlRequest, ControlResponse, DEFAULT_QUERY_LIMIT};
pub use message::{CoreMessage, DeviceMessage, ServoTableEntry};
pub use parse::{decode_device_line, ParseError};
