//! Supervised adapter lifecycle.
//!
//! One [`AdapterRunner`] per enabled adapter. The runner owns the state
//! machine and the restart loop:
//!
//! ```text
//! Idle → Starting → Running → Degraded → Running
//!                 ↘ Error (backoff) → Starting
//!          Running → Stopping → Idle          (on shutdown)
//! ```
//!
//! The adapter's `run` future executes inside its own spawned task, so a
//! panic is caught as a `JoinError` and becomes an `Error` state — never a
//! process abort. Backoff between restarts is exponential from
//! `retry.base_ms` to `retry.max_ms` with full jitter and no attempt cap.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{
    AdapterContext, AdapterHealth, AdapterState, EventSink, HardwareAdapter, StatusHandle,
};

/// Backoff bounds, taken from the `retry` config block.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Full-jitter delay for the given attempt (0-based): uniform in
    /// `0..=min(max, base * 2^attempt)`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max);
        let ceiling = exp.as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// A supervised, restarting adapter task.
pub struct AdapterRunner {
    adapter: Arc<dyn HardwareAdapter>,
    status: StatusHandle,
    handle: JoinHandle<()>,
}

impl AdapterRunner {
    /// Spawn the supervision loop for `adapter`.
    #[must_use]
    pub fn spawn(
        adapter: Arc<dyn HardwareAdapter>,
        config: serde_json::Value,
        sink: Arc<dyn EventSink>,
        shutdown: watch::Receiver<bool>,
        backoff: BackoffPolicy,
    ) -> Self {
        let status = StatusHandle::new(adapter.info().name);
        let handle = tokio::spawn(supervise(
            Arc::clone(&adapter),
            config,
            sink,
            status.clone(),
            shutdown,
            backoff,
        ));
        Self {
            adapter,
            status,
            handle,
        }
    }

    /// The supervised adapter (for capability checks and unlock dispatch).
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn HardwareAdapter> {
        &self.adapter
    }

    /// Health snapshot.
    pub async fn health(&self) -> AdapterHealth {
        self.status.health().await
    }

    /// Wait for the supervision loop to finish after shutdown was signalled.
    pub async fn join(self) {
        let _ = self.handle.await;
    }

    /// Wait up to `grace` for the loop to finish, then abort it.
    pub async fn shutdown(mut self, grace: Duration) {
        if tokio::time::timeout(grace, &mut self.handle).await.is_err() {
            tracing::warn!(adapter = self.adapter.info().name, "adapter ignored shutdown, aborting");
            self.handle.abort();
            let _ = self.handle.await;
        }
    }

    /// Abort the supervision loop outright (shutdown ceiling exceeded).
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl std::fmt::Debug for AdapterRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRunner")
            .field("adapter", &self.adapter.info().name)
            .finish_non_exhaustive()
    }
}

async fn supervise(
    adapter: Arc<dyn HardwareAdapter>,
    config: serde_json::Value,
    sink: Arc<dyn EventSink>,
    status: StatusHandle,
    mut shutdown: watch::Receiver<bool>,
    backoff: BackoffPolicy,
) {
    let name = adapter.info().name;
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        status.record_attempt().await;
        tracing::info!(adapter = name, attempt, "starting adapter");

        let ctx = AdapterContext {
            config: config.clone(),
            sink: Arc::clone(&sink),
            status: status.clone(),
            shutdown: shutdown.clone(),
        };

        // Run in a child task so a panicking driver surfaces as JoinError
        // instead of unwinding through the supervisor.
        let run = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.run(ctx).await })
        };

        match run.await {
            Ok(Ok(())) => {
                tracing::info!(adapter = name, "adapter stopped");
                status.set_state(AdapterState::Stopping).await;
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!(adapter = name, error = %e, "adapter failed, will restart");
                status.record_error(&e.to_string()).await;
            }
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    "adapter panicked".to_owned()
                } else {
                    join_err.to_string()
                };
                tracing::error!(adapter = name, reason = %reason, "adapter task died, will restart");
                status.record_error(&reason).await;
            }
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!(adapter = name, delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    status.set_state(AdapterState::Idle).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{AdapterError, AdapterInfo, Capability};
    use bridge_core::event::{EventType, RawHardwareEvent};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct CountingSink {
        events: AtomicU64,
    }

    #[async_trait::async_trait]
    impl EventSink for CountingSink {
        async fn push(&self, _event: RawHardwareEvent) {
            self.events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Emits one event then waits for shutdown.
    struct WellBehaved;

    #[async_trait::async_trait]
    impl HardwareAdapter for WellBehaved {
        fn info(&self) -> AdapterInfo {
            AdapterInfo {
                name: "well-behaved",
                capabilities: vec![Capability::EmitEvents],
            }
        }

        async fn run(&self, mut ctx: AdapterContext) -> Result<(), AdapterError> {
            ctx.status.report_running().await;
            ctx.sink
                .push(RawHardwareEvent {
                    external_user_id: "u1".to_owned(),
                    timestamp: chrono::Utc::now(),
                    event_type: EventType::Entry,
                    raw_data: serde_json::Map::new(),
                    adapter_name: "well-behaved".to_owned(),
                })
                .await;
            ctx.status.mark_event().await;
            ctx.shutdown_requested().await;
            Ok(())
        }
    }

    /// Fails on every start.
    struct AlwaysFails;

    #[async_trait::async_trait]
    impl HardwareAdapter for AlwaysFails {
        fn info(&self) -> AdapterInfo {
            AdapterInfo {
                name: "always-fails",
                capabilities: vec![Capability::EmitEvents],
            }
        }

        async fn run(&self, _ctx: AdapterContext) -> Result<(), AdapterError> {
            Err(AdapterError::Connect {
                adapter: "always-fails".to_owned(),
                reason: "no device".to_owned(),
            })
        }
    }

    /// Panics on every start.
    struct Panicking;

    #[async_trait::async_trait]
    impl HardwareAdapter for Panicking {
        fn info(&self) -> AdapterInfo {
            AdapterInfo {
                name: "panicking",
                capabilities: vec![Capability::EmitEvents],
            }
        }

        async fn run(&self, _ctx: AdapterContext) -> Result<(), AdapterError> {
            panic!("driver bug");
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn healthy_adapter_runs_and_stops_cleanly() {
        let (tx, rx) = watch::channel(false);
        let sink = Arc::new(CountingSink::default());
        let runner = AdapterRunner::spawn(
            Arc::new(WellBehaved),
            serde_json::Value::Null,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            rx,
            fast_backoff(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.health().await.state, AdapterState::Running);
        assert_eq!(sink.events.load(Ordering::Relaxed), 1);

        tx.send(true).unwrap();
        runner.join().await;
    }

    #[tokio::test]
    async fn failing_adapter_lands_in_error_and_retries() {
        let (tx, rx) = watch::channel(false);
        let sink = Arc::new(CountingSink::default());
        let runner = AdapterRunner::spawn(
            Arc::new(AlwaysFails),
            serde_json::Value::Null,
            sink as Arc<dyn EventSink>,
            rx,
            fast_backoff(),
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        let health = runner.health().await;
        // Multiple restarts happened; state oscillates Starting/Error.
        assert!(health.connect_attempts > 1);
        assert!(health.last_error.is_some());

        tx.send(true).unwrap();
        runner.join().await;
    }

    #[tokio::test]
    async fn panicking_adapter_does_not_kill_its_peer() {
        let (tx, rx) = watch::channel(false);
        let sink = Arc::new(CountingSink::default());

        let bad = AdapterRunner::spawn(
            Arc::new(Panicking),
            serde_json::Value::Null,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            rx.clone(),
            fast_backoff(),
        );
        let good = AdapterRunner::spawn(
            Arc::new(WellBehaved),
            serde_json::Value::Null,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            rx,
            fast_backoff(),
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(good.health().await.state, AdapterState::Running);
        assert!(bad.health().await.connect_attempts > 1);
        assert_eq!(bad.health().await.last_error.as_deref(), Some("adapter panicked"));

        tx.send(true).unwrap();
        bad.join().await;
        good.join().await;
    }

    #[test]
    fn backoff_is_bounded_and_jittered() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
        };
        for attempt in 0..20 {
            let delay = policy.delay(attempt);
            assert!(delay <= Duration::from_millis(1_000));
        }
    }
}
