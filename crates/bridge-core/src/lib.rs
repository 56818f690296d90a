//! Core library for the Bridge — the on-premise edge agent that connects gym
//! biometric hardware to the cloud control plane.
//!
//! This crate holds everything that does not touch a socket: configuration,
//! the device identity and its credential store, HMAC request signing, the
//! event model and processor, the durable queue policy on top of
//! `bridge-storage`, and the resource tier model. The `bridge-agent` binary
//! wires these together with the cloud client, the adapter runners, and the
//! local control API.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod deadletter;
pub mod error;
pub mod event;
pub mod identity;
pub mod processor;
pub mod queue;
pub mod tier;
