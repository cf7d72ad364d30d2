//! Domain entities shared by both protocol roles.

pub mod delegation;
pub mod lease;
pub mod resource;
pub mod snapshot;
