#![forbid(unsafe_code)]

//! AWCP — Agent Workspace Collaboration Protocol engine.
//!
//! One agent (the delegator) hands a bounded slice of its filesystem to a
//! second agent (the executor), which performs a task against a
//! materialized copy and returns the modified state. This crate provides
//! both protocol engines, the admission and snapshot pipelines, the
//! workspace lifecycle, and the pluggable transport contract.

pub mod config;
pub mod delegator;
pub mod errors;
pub mod executor;
pub mod models;
pub mod protocol;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AwcpError, ErrorCode, ProtocolError, Result};
