//! The Bridge agent: everything that touches a socket.
//!
//! Wires `bridge-core` and `bridge-adapters` into a long-lived service — the
//! supervisor owns the lifecycle, the cloud client speaks the signed HTTP
//! protocol, and the background loops (submission, heartbeat, commands,
//! health, compaction) run as cooperative tasks under one shutdown signal.
//! The local control API exposes status and door control on localhost.

pub mod api;
pub mod cloud;
pub mod commands;
pub mod door;
pub mod error;
pub mod fleet;
pub mod health;
pub mod heartbeat;
pub mod sink;
pub mod submit;
pub mod supervisor;

/// Agent version reported in heartbeats and `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
