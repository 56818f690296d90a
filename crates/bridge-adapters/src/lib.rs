//! Hardware adapters for the Bridge.
//!
//! An adapter is a driver for one class of biometric/access hardware. It
//! pushes [`RawHardwareEvent`]s into the pipeline through an [`EventSink`]
//! and, when it advertises the capability, services door-unlock calls.
//!
//! Adapters never manage their own lifecycle: the [`runner`] owns the state
//! machine (Idle → Starting → Running → Degraded/Error → …), restarts failed
//! adapters with jittered exponential backoff, and isolates panics so one
//! misbehaving driver cannot take down the supervisor or its peers.
//!
//! Built-in adapters are registered by name in [`registry`]; the supervisor
//! starts only the ones listed in `enabled_adapters`.

pub mod essl;
pub mod realtime;
pub mod registry;
pub mod runner;
pub mod simulator;
pub mod zkteco;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, watch};

use bridge_core::event::RawHardwareEvent;

/// Errors an adapter can surface to its runner.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Could not reach or handshake with the device.
    #[error("adapter '{adapter}' connect failed: {reason}")]
    Connect { adapter: String, reason: String },

    /// The connection dropped or an I/O operation failed mid-stream.
    #[error("adapter '{adapter}' io error: {reason}")]
    Io { adapter: String, reason: String },

    /// The adapter's configuration block is invalid.
    #[error("adapter '{adapter}' config invalid: {reason}")]
    Config { adapter: String, reason: String },

    /// The adapter does not advertise the requested capability.
    #[error("adapter '{adapter}' does not support {capability}")]
    Unsupported {
        adapter: String,
        capability: &'static str,
    },

    /// The device is connected but refused the operation.
    #[error("adapter '{adapter}' device error: {reason}")]
    Device { adapter: String, reason: String },
}

/// The closed set of adapter capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    EmitEvents,
    UnlockDoor,
    EnrollUser,
    ListUsers,
}

/// Static description of an adapter.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterInfo {
    pub name: &'static str,
    pub capabilities: Vec<Capability>,
}

/// Lifecycle state of one adapter, owned by its runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    Idle,
    Starting,
    Running,
    Degraded,
    Error,
    Stopping,
}

/// Health snapshot served by `Health()` and the local API.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterHealth {
    pub name: String,
    pub state: AdapterState,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub connect_attempts: u64,
}

impl AdapterHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: AdapterState::Idle,
            last_error: None,
            last_error_at: None,
            last_event_at: None,
            connect_attempts: 0,
        }
    }
}

/// Where adapters push their events.
///
/// Implemented by the agent over the event processor. `push` never fails
/// from the adapter's point of view: queue-full and processing errors are
/// counted and logged behind the sink, so a full queue can never crash a
/// driver.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn push(&self, event: RawHardwareEvent);
}

/// Shared, runner-owned status cell an adapter reports into.
#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<RwLock<AdapterHealth>>,
}

impl StatusHandle {
    fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(AdapterHealth::new(name))),
        }
    }

    /// Current health snapshot.
    pub async fn health(&self) -> AdapterHealth {
        self.inner.read().await.clone()
    }

    /// The adapter connected and is receiving events.
    pub async fn report_running(&self) {
        let mut guard = self.inner.write().await;
        guard.state = AdapterState::Running;
    }

    /// Transient trouble; the adapter is still trying on its own.
    pub async fn report_degraded(&self, reason: &str) {
        let mut guard = self.inner.write().await;
        guard.state = AdapterState::Degraded;
        guard.last_error = Some(reason.to_owned());
        guard.last_error_at = Some(Utc::now());
    }

    /// An event was delivered to the sink just now.
    pub async fn mark_event(&self) {
        let mut guard = self.inner.write().await;
        guard.last_event_at = Some(Utc::now());
    }

    async fn set_state(&self, state: AdapterState) {
        let mut guard = self.inner.write().await;
        guard.state = state;
    }

    async fn record_error(&self, reason: &str) {
        let mut guard = self.inner.write().await;
        guard.state = AdapterState::Error;
        guard.last_error = Some(reason.to_owned());
        guard.last_error_at = Some(Utc::now());
    }

    async fn record_attempt(&self) {
        let mut guard = self.inner.write().await;
        guard.state = AdapterState::Starting;
        guard.connect_attempts += 1;
    }
}

impl std::fmt::Debug for StatusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusHandle").finish_non_exhaustive()
    }
}

/// Everything an adapter's `run` receives from its runner.
pub struct AdapterContext {
    /// The adapter's block from `adapter_configs`, vendor-opaque.
    pub config: serde_json::Value,
    pub sink: Arc<dyn EventSink>,
    pub status: StatusHandle,
    /// Flips to `true` when the supervisor shuts down.
    pub shutdown: watch::Receiver<bool>,
}

impl AdapterContext {
    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Wait until shutdown is requested.
    pub async fn shutdown_requested(&mut self) {
        while !*self.shutdown.borrow() {
            if self.shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterContext").finish_non_exhaustive()
    }
}

/// A driver for one class of hardware.
///
/// `run` connects to the device, calls `ctx.status.report_running()` once
/// connected, and pushes events until shutdown (return `Ok`) or a failure it
/// cannot recover from internally (return `Err`; the runner restarts it with
/// backoff). Implementations may poll internally — polling stays invisible
/// above this boundary.
#[async_trait::async_trait]
pub trait HardwareAdapter: Send + Sync + 'static {
    fn info(&self) -> AdapterInfo;

    /// Connect and pump events until shutdown or failure.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] on connect or stream failure; the runner
    /// applies backoff and restarts.
    async fn run(&self, ctx: AdapterContext) -> Result<(), AdapterError>;

    /// Pulse the door relay open for `duration`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Unsupported`] unless the adapter advertises
    /// [`Capability::UnlockDoor`] and overrides this.
    async fn unlock(&self, duration: Duration) -> Result<(), AdapterError> {
        let _ = duration;
        Err(AdapterError::Unsupported {
            adapter: self.info().name.to_owned(),
            capability: "unlock_door",
        })
    }
}
