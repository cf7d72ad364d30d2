//! Wire-level protocol definitions shared by both roles.

pub mod events;
pub mod messages;

/// Protocol version carried on every wire message.
pub const PROTOCOL_VERSION: &str = "1";
