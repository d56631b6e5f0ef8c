//! DevShare Protocol Definitions
//!
//! This crate defines the JSON frames exchanged over the control channel
//! between a relay and a connected agent.

pub mod messages;

pub use messages::*;

/// Default path the control channel upgrade is served on
pub const DEFAULT_CONTROL_PATH: &str = "/ws";

/// Default relay listen port
pub const DEFAULT_RELAY_PORT: u16 = 3000;
