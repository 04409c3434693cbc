//! Core engine for the perch chat bot.
//!
//! This crate is framework-agnostic: the messaging client lives behind the
//! [`gateway::GatewaySession`] port, implemented by adapter crates. What lives
//! here is the part that has to be right for the process to start and stop
//! cleanly: the resource pools, the shutdown registry, the extension manager
//! and the lifecycle state machine tying them together.

pub mod config;
pub mod errors;
pub mod extensions;
pub mod gateway;
pub mod ini;
pub mod logging;
pub mod pools;
pub mod runtime;
pub mod shutdown;

pub use errors::{Error, Result};
