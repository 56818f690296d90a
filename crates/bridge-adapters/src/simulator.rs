//! Simulator adapter: synthetic events without hardware.
//!
//! Used for install verification and demos. Emits entry/exit/denied events
//! on a fixed interval from a small pool of synthetic users, and accepts
//! unlock calls by logging them. Events from this adapter are flagged
//! `is_simulated` by the processor.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use bridge_core::event::{EventType, RawHardwareEvent};

use crate::{AdapterContext, AdapterError, AdapterInfo, Capability, HardwareAdapter};

pub const NAME: &str = "simulator";

/// `adapter_configs.simulator` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SimulatorConfig {
    /// Milliseconds between synthetic events.
    interval_ms: u64,
    /// Synthetic user pool, cycled in order.
    users: Vec<String>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            users: vec![
                "sim-user-1".to_owned(),
                "sim-user-2".to_owned(),
                "sim-user-3".to_owned(),
            ],
        }
    }
}

/// The simulator.
#[derive(Debug, Default)]
pub struct SimulatorAdapter;

#[async_trait::async_trait]
impl HardwareAdapter for SimulatorAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: NAME,
            capabilities: vec![Capability::EmitEvents, Capability::UnlockDoor],
        }
    }

    async fn run(&self, mut ctx: AdapterContext) -> Result<(), AdapterError> {
        let config: SimulatorConfig = if ctx.config.is_null() {
            SimulatorConfig::default()
        } else {
            serde_json::from_value(ctx.config.clone()).map_err(|e| AdapterError::Config {
                adapter: NAME.to_owned(),
                reason: e.to_string(),
            })?
        };
        if config.users.is_empty() {
            return Err(AdapterError::Config {
                adapter: NAME.to_owned(),
                reason: "users must not be empty".to_owned(),
            });
        }

        ctx.status.report_running().await;
        tracing::info!(interval_ms = config.interval_ms, "simulator running");

        let cycle = [EventType::Entry, EventType::Exit, EventType::Denied];
        let mut tick: usize = 0;
        let mut interval = tokio::time::interval(Duration::from_millis(config.interval_ms.max(10)));

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let user = &config.users[tick % config.users.len()];
                    let event_type = cycle[tick % cycle.len()];
                    tick = tick.wrapping_add(1);

                    let mut raw_data = serde_json::Map::new();
                    raw_data.insert("sequence".to_owned(), serde_json::Value::from(tick));
                    ctx.sink
                        .push(RawHardwareEvent {
                            external_user_id: user.clone(),
                            timestamp: Utc::now(),
                            event_type,
                            raw_data,
                            adapter_name: NAME.to_owned(),
                        })
                        .await;
                    ctx.status.mark_event().await;
                }
                () = ctx.shutdown_requested() => return Ok(()),
            }
        }
    }

    async fn unlock(&self, duration: Duration) -> Result<(), AdapterError> {
        tracing::info!(duration_ms = duration.as_millis() as u64, "simulator door unlocked");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{EventSink, StatusHandle};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::watch;

    #[derive(Default)]
    struct CountingSink {
        events: AtomicU64,
    }

    #[async_trait::async_trait]
    impl EventSink for CountingSink {
        async fn push(&self, event: RawHardwareEvent) {
            assert_eq!(event.adapter_name, NAME);
            assert!(!event.external_user_id.is_empty());
            self.events.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn emits_events_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let sink = Arc::new(CountingSink::default());
        let config = serde_json::json!({ "interval_ms": 10 });

        let adapter = SimulatorAdapter;
        let ctx = AdapterContext {
            config,
            sink: Arc::clone(&sink) as Arc<dyn EventSink>,
            status: StatusHandle::new(NAME),
            shutdown: rx,
        };

        let handle = tokio::spawn(async move { adapter.run(ctx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert!(sink.events.load(Ordering::Relaxed) >= 3);
    }

    #[tokio::test]
    async fn empty_user_pool_is_a_config_error() {
        let (_tx, rx) = watch::channel(false);
        let adapter = SimulatorAdapter;
        let ctx = AdapterContext {
            config: serde_json::json!({ "users": [] }),
            sink: Arc::new(CountingSink::default()) as Arc<dyn EventSink>,
            status: StatusHandle::new(NAME),
            shutdown: rx,
        };
        assert!(matches!(
            adapter.run(ctx).await,
            Err(AdapterError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn unlock_succeeds() {
        SimulatorAdapter
            .unlock(Duration::from_millis(3_000))
            .await
            .unwrap();
    }
}
