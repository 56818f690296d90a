//! The heartbeat loop.
//!
//! Reports device status to the cloud on the tier's cadence and applies any
//! config overrides the cloud pushes back. Unlock outcomes from the command
//! loop ride along in `commandResults`. Heartbeat failures are logged and
//! never fatal.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};

use bridge_core::processor::EventProcessor;
use bridge_core::queue::DurableQueue;
use bridge_core::tier::TierParams;

use crate::cloud::CloudClient;
use crate::door::DoorController;
use crate::fleet::AdapterSet;

/// Unlock outcomes queued for the next heartbeat.
#[derive(Debug, Default)]
pub struct CommandResults {
    results: Mutex<Vec<Value>>,
}

impl CommandResults {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one command outcome.
    pub async fn record(&self, command_id: &str, ok: bool, detail: &str) {
        self.results.lock().await.push(json!({
            "commandId": command_id,
            "ok": ok,
            "detail": detail,
        }));
    }

    /// Take everything recorded so far.
    pub async fn drain(&self) -> Vec<Value> {
        std::mem::take(&mut *self.results.lock().await)
    }
}

/// Run the heartbeat loop until shutdown.
#[allow(clippy::too_many_arguments)]
pub async fn run_heartbeat_loop(
    cloud: Arc<CloudClient>,
    queue: Arc<DurableQueue>,
    processor: Arc<EventProcessor>,
    adapters: Arc<AdapterSet>,
    door: Arc<DoorController>,
    tier_rx: watch::Receiver<TierParams>,
    command_results: Arc<CommandResults>,
    started_at: Instant,
    mut shutdown: watch::Receiver<bool>,
) {
    // A cloud-pushed interval override takes precedence over the tier table
    // until the next override replaces it.
    let mut interval_override: Option<std::time::Duration> = None;
    tracing::info!("heartbeat loop started");

    loop {
        let params = *tier_rx.borrow();
        let interval = interval_override.unwrap_or(params.heartbeat_interval);
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        let Some(device_id) = cloud.device_id().await else {
            continue;
        };

        let queue_stats = queue.stats().await.unwrap_or_default();
        let adapter_health = adapters.health().await;
        let results = command_results.drain().await;

        let body = json!({
            "deviceId": device_id,
            "tier": params.tier,
            "queueStats": queue_stats,
            "pipeline": processor.counters(),
            "adapterHealth": adapter_health,
            "uptimeMs": started_at.elapsed().as_millis() as u64,
            "version": crate::VERSION,
            "commandResults": results,
        });

        match cloud.heartbeat(body).await {
            Ok(overrides) => {
                if let Some(secs) = overrides.heartbeat_interval {
                    let next = std::time::Duration::from_secs(secs.max(5));
                    if interval_override != Some(next) {
                        tracing::info!(heartbeat_interval_secs = secs, "cloud override applied");
                        interval_override = Some(next);
                    }
                }
                if let Some(max) = overrides.queue_max_size {
                    queue.set_max_size(max);
                }
                if let Some(unlock_ms) = overrides.unlock_duration {
                    door.set_default_duration_ms(unlock_ms);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat failed");
            }
        }
    }
    tracing::info!("heartbeat loop stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_results_drain_once() {
        let results = CommandResults::new();
        results.record("cmd-1", true, "unlocked").await;
        results.record("cmd-2", false, "no door adapter").await;

        let drained = results.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0]["commandId"], "cmd-1");
        assert_eq!(drained[1]["ok"], false);

        assert!(results.drain().await.is_empty());
    }
}
