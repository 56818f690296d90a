//! The managed adapter table.
//!
//! Owns one [`AdapterRunner`] per enabled adapter plus a per-adapter stop
//! signal, so adapters can be enabled and disabled at runtime from the local
//! API without touching their peers. Only the supervisor mutates this table;
//! every other task reads health snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};

use bridge_adapters::runner::{AdapterRunner, BackoffPolicy};
use bridge_adapters::{AdapterHealth, AdapterState, Capability, EventSink, HardwareAdapter, registry};
use bridge_core::config::BridgeConfig;
use bridge_core::error::CommandError;

struct ManagedAdapter {
    adapter: Arc<dyn HardwareAdapter>,
    config: serde_json::Value,
    runner: Option<AdapterRunner>,
    stop_tx: Option<watch::Sender<bool>>,
}

impl ManagedAdapter {
    fn is_running(&self) -> bool {
        self.runner.is_some()
    }
}

/// All adapters the supervisor knows about, in `enabled_adapters` order.
pub struct AdapterSet {
    inner: RwLock<Inner>,
    sink: Arc<dyn EventSink>,
    backoff: BackoffPolicy,
}

struct Inner {
    order: Vec<String>,
    adapters: HashMap<String, ManagedAdapter>,
}

impl AdapterSet {
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, backoff: BackoffPolicy) -> Self {
        Self {
            inner: RwLock::new(Inner {
                order: Vec::new(),
                adapters: HashMap::new(),
            }),
            sink,
            backoff,
        }
    }

    /// Bring up every adapter in `enabled_adapters`. Unknown names warn and
    /// are skipped; individual start failures surface later through the
    /// runner's health, never here — per-adapter trouble is non-fatal.
    pub async fn start_from_config(&self, config: &BridgeConfig) {
        for name in &config.enabled_adapters {
            let Some(adapter) = registry::create(name) else {
                tracing::warn!(
                    adapter = %name,
                    known = ?registry::known_adapters(),
                    "unknown adapter in enabled_adapters, skipping"
                );
                continue;
            };
            let adapter_config = config
                .adapter_configs
                .get(name)
                .cloned()
                .unwrap_or(serde_json::Value::Null);

            let mut inner = self.inner.write().await;
            if !inner.order.contains(name) {
                inner.order.push(name.clone());
            }
            let managed = ManagedAdapter {
                adapter,
                config: adapter_config,
                runner: None,
                stop_tx: None,
            };
            inner.adapters.insert(name.clone(), managed);
            drop(inner);

            if let Err(e) = self.enable(name).await {
                tracing::warn!(adapter = %name, error = %e, "adapter failed to start");
            }
        }
    }

    /// Start (or restart) one adapter's supervised runner.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnknownCommand`] for names the registry does
    /// not know.
    pub async fn enable(&self, name: &str) -> Result<(), CommandError> {
        let mut inner = self.inner.write().await;

        if !inner.adapters.contains_key(name) {
            // Enabled at runtime without a config block.
            let adapter = registry::create(name).ok_or_else(|| CommandError::UnknownCommand {
                kind: format!("adapter '{name}'"),
            })?;
            inner.order.push(name.to_owned());
            inner.adapters.insert(
                name.to_owned(),
                ManagedAdapter {
                    adapter,
                    config: serde_json::Value::Null,
                    runner: None,
                    stop_tx: None,
                },
            );
        }

        let Some(managed) = inner.adapters.get_mut(name) else {
            return Err(CommandError::UnknownCommand {
                kind: format!("adapter '{name}'"),
            });
        };
        if managed.is_running() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = AdapterRunner::spawn(
            Arc::clone(&managed.adapter),
            managed.config.clone(),
            Arc::clone(&self.sink),
            stop_rx,
            self.backoff,
        );
        managed.runner = Some(runner);
        managed.stop_tx = Some(stop_tx);
        tracing::info!(adapter = %name, "adapter enabled");
        Ok(())
    }

    /// Stop one adapter and wait briefly for it to wind down.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::UnknownCommand`] for unmanaged names.
    pub async fn disable(&self, name: &str) -> Result<(), CommandError> {
        let (runner, stop_tx) = {
            let mut inner = self.inner.write().await;
            let managed =
                inner
                    .adapters
                    .get_mut(name)
                    .ok_or_else(|| CommandError::UnknownCommand {
                        kind: format!("adapter '{name}'"),
                    })?;
            (managed.runner.take(), managed.stop_tx.take())
        };

        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(true);
        }
        if let Some(runner) = runner {
            runner.shutdown(Duration::from_secs(5)).await;
        }
        tracing::info!(adapter = %name, "adapter disabled");
        Ok(())
    }

    /// Health snapshots in start order, including disabled adapters.
    pub async fn health(&self) -> Vec<AdapterHealth> {
        let inner = self.inner.read().await;
        let mut out = Vec::with_capacity(inner.order.len());
        for name in &inner.order {
            if let Some(managed) = inner.adapters.get(name) {
                if let Some(runner) = &managed.runner {
                    out.push(runner.health().await);
                } else {
                    out.push(AdapterHealth {
                        name: name.clone(),
                        state: AdapterState::Idle,
                        last_error: None,
                        last_error_at: None,
                        last_event_at: None,
                        connect_attempts: 0,
                    });
                }
            }
        }
        out
    }

    /// Whether `name` currently has a running runner.
    pub async fn is_enabled(&self, name: &str) -> bool {
        self.inner
            .read()
            .await
            .adapters
            .get(name)
            .is_some_and(ManagedAdapter::is_running)
    }

    /// Resolve the adapter a door-unlock should go to: the named one, or the
    /// first enabled adapter advertising [`Capability::UnlockDoor`].
    ///
    /// # Errors
    ///
    /// - [`CommandError::UnknownCommand`] if a named adapter is not managed.
    /// - [`CommandError::NoDoorAdapter`] if nothing door-capable is enabled.
    pub async fn unlock_target(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn HardwareAdapter>, CommandError> {
        let inner = self.inner.read().await;

        if let Some(name) = name {
            let managed = inner
                .adapters
                .get(name)
                .ok_or_else(|| CommandError::UnknownCommand {
                    kind: format!("adapter '{name}'"),
                })?;
            if !managed
                .adapter
                .info()
                .capabilities
                .contains(&Capability::UnlockDoor)
            {
                return Err(CommandError::NoDoorAdapter);
            }
            return Ok(Arc::clone(&managed.adapter));
        }

        for name in &inner.order {
            if let Some(managed) = inner.adapters.get(name) {
                if managed.is_running()
                    && managed
                        .adapter
                        .info()
                        .capabilities
                        .contains(&Capability::UnlockDoor)
                {
                    return Ok(Arc::clone(&managed.adapter));
                }
            }
        }
        Err(CommandError::NoDoorAdapter)
    }

    /// Stop every adapter: phase one of shutdown, so no new events arrive
    /// while the queue drains.
    pub async fn stop_all(&self, grace: Duration) {
        let (runners, stop_txs): (Vec<_>, Vec<_>) = {
            let mut inner = self.inner.write().await;
            let names: Vec<String> = inner.order.clone();
            let mut runners = Vec::new();
            let mut stop_txs = Vec::new();
            for name in names {
                if let Some(managed) = inner.adapters.get_mut(&name) {
                    if let Some(runner) = managed.runner.take() {
                        runners.push(runner);
                    }
                    if let Some(tx) = managed.stop_tx.take() {
                        stop_txs.push(tx);
                    }
                }
            }
            (runners, stop_txs)
        };

        for tx in &stop_txs {
            let _ = tx.send(true);
        }

        // Wind every runner down in parallel so the slowest one bounds the
        // phase, not the sum.
        let mut waits = Vec::with_capacity(runners.len());
        for runner in runners {
            waits.push(tokio::spawn(runner.shutdown(grace)));
        }
        for wait in waits {
            let _ = wait.await;
        }
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSet").finish_non_exhaustive()
    }
}
