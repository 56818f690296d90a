//! The submission service: batched outbound delivery with backoff.
//!
//! One cooperative task. Each cycle sleeps the tier's submit interval
//! (halved under backpressure, stretched by failure backoff), leases a
//! batch, POSTs it, and acks per the server's verdict. The loop never exits
//! on error — offline is a normal state for a gym.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;

use bridge_core::config::RetryConfig;
use bridge_core::queue::{DurableQueue, OutboundEvent};
use bridge_core::tier::TierParams;

use crate::cloud::CloudClient;

/// Upper bound on the stored bytes leased into one batch.
const MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Floor for the backpressure-halved interval.
const BACKPRESSURE_FLOOR: Duration = Duration::from_secs(2);

/// Submission counters for the status endpoint.
#[derive(Debug, Default)]
pub struct SubmitCounters {
    pub batches_sent: AtomicU64,
    pub events_accepted: AtomicU64,
    pub events_rejected: AtomicU64,
    pub failures: AtomicU64,
}

/// Snapshot of [`SubmitCounters`].
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct SubmitCountersSnapshot {
    pub batches_sent: u64,
    pub events_accepted: u64,
    pub events_rejected: u64,
    pub failures: u64,
}

impl SubmitCounters {
    #[must_use]
    pub fn snapshot(&self) -> SubmitCountersSnapshot {
        SubmitCountersSnapshot {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            events_accepted: self.events_accepted.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Backpressure with hysteresis: engage above 80 % of the queue bound,
/// release below 50 %.
#[derive(Debug, Default)]
struct Backpressure {
    active: bool,
}

impl Backpressure {
    fn update(&mut self, pending: u64, queue_max: u64) -> bool {
        let high = queue_max.saturating_mul(8) / 10;
        let low = queue_max / 2;
        if self.active {
            if pending < low {
                self.active = false;
            }
        } else if pending > high {
            self.active = true;
        }
        self.active
    }
}

/// Exponential failure backoff capped at `retry.max_ms`.
fn failure_backoff(consecutive_failures: u32, retry: RetryConfig) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let exp = retry
        .base_ms
        .saturating_mul(1u64 << consecutive_failures.saturating_sub(1).min(32));
    Duration::from_millis(exp.min(retry.max_ms))
}

/// The wire projection of one outbound event. `raw_data` travels in the
/// clear here — the link is TLS; at-rest sealing happens in the queue.
fn projection(outbound: &OutboundEvent) -> Value {
    let event = &outbound.event;
    json!({
        "eventId": event.event_id,
        "deviceId": event.device_id,
        "externalUserId": event.external_user_id,
        "timestamp": event.timestamp.to_rfc3339(),
        "eventType": event.event_type,
        "isSimulated": event.is_simulated,
        "rawData": event.raw_data,
    })
}

/// Run the submission loop until shutdown.
pub async fn run_submission_loop(
    queue: Arc<DurableQueue>,
    cloud: Arc<CloudClient>,
    tier_rx: watch::Receiver<TierParams>,
    retry: RetryConfig,
    counters: Arc<SubmitCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backpressure = Backpressure::default();
    let mut consecutive_failures: u32 = 0;
    tracing::info!("submission service started");

    loop {
        let params = *tier_rx.borrow();
        let pending = queue.stats().await.map_or(0, |s| s.pending);

        let mut interval = if backpressure.update(pending, params.queue_max_size) {
            (params.submit_interval / 2).max(BACKPRESSURE_FLOOR)
        } else {
            params.submit_interval
        };
        interval = interval.max(failure_backoff(consecutive_failures, retry));

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        // Unpaired mode: adapters run, submission waits for an identity.
        if !cloud.is_paired().await {
            continue;
        }

        let batch = match queue
            .lease_batch(params.batch_size as usize, MAX_BATCH_BYTES)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, "lease failed, skipping cycle");
                continue;
            }
        };
        if batch.is_empty() {
            continue;
        }

        let projections: Vec<Value> = batch.iter().map(projection).collect();
        match cloud.submit_events(&projections).await {
            Ok(verdict) => {
                consecutive_failures = 0;
                counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                ack_verdict(&queue, &counters, &batch, &verdict.accepted, &verdict.rejected).await;
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                counters.failures.fetch_add(1, Ordering::Relaxed);
                let retriable = e.is_retriable() || e.is_unauthenticated();
                let reason = e.to_string();
                if e.is_unauthenticated() {
                    // The client already ran its rotation probe; the batch
                    // waits for the next cycle either way.
                    tracing::warn!(error = %reason, "submission unauthenticated, batch will retry");
                } else {
                    tracing::warn!(
                        error = %reason,
                        consecutive_failures,
                        "submission failed, batch will retry with backoff"
                    );
                }
                let ids: Vec<u64> = batch.iter().map(|o| o.queue_id).collect();
                if let Err(ack_err) = queue.ack_failed(&ids, &reason, retriable).await {
                    tracing::error!(error = %ack_err, "ack_failed after submit failure");
                }
            }
        }
    }
    tracing::info!("submission service stopped");
}

/// Apply the server's per-event verdict: named rejections fail terminally,
/// everything else in the batch is sent.
async fn ack_verdict(
    queue: &DurableQueue,
    counters: &SubmitCounters,
    batch: &[OutboundEvent],
    accepted: &[String],
    rejected: &[crate::cloud::RejectedEvent],
) {
    let rejected_ids: Vec<u64> = batch
        .iter()
        .filter(|o| rejected.iter().any(|r| r.event_id == o.event.event_id))
        .map(|o| o.queue_id)
        .collect();
    let sent_ids: Vec<u64> = batch
        .iter()
        .filter(|o| !rejected.iter().any(|r| r.event_id == o.event.event_id))
        .map(|o| o.queue_id)
        .collect();

    counters
        .events_accepted
        .fetch_add(sent_ids.len() as u64, Ordering::Relaxed);
    counters
        .events_rejected
        .fetch_add(rejected_ids.len() as u64, Ordering::Relaxed);

    if accepted.len() + rejected.len() < batch.len() {
        tracing::debug!(
            batch = batch.len(),
            accepted = accepted.len(),
            rejected = rejected.len(),
            "server verdict did not name every event, unnamed treated as accepted"
        );
    }
    for reject in rejected {
        tracing::warn!(event_id = %reject.event_id, reason = %reject.reason, "event rejected by cloud");
    }

    if !sent_ids.is_empty() {
        if let Err(e) = queue.ack_sent(&sent_ids).await {
            tracing::error!(error = %e, "ack_sent failed");
        }
    }
    if !rejected_ids.is_empty() {
        if let Err(e) = queue
            .ack_failed(&rejected_ids, "validation_failed", false)
            .await
        {
            tracing::error!(error = %e, "ack_failed failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bridge_core::event::{EventType, StandardEvent};
    use chrono::{TimeZone, Utc};

    #[test]
    fn backpressure_has_hysteresis() {
        let mut bp = Backpressure::default();
        assert!(!bp.update(700, 1_000));
        // Over 80 % engages.
        assert!(bp.update(850, 1_000));
        // Stays engaged until under 50 %.
        assert!(bp.update(600, 1_000));
        assert!(!bp.update(400, 1_000));
        assert!(!bp.update(700, 1_000));
    }

    #[test]
    fn failure_backoff_grows_and_caps() {
        let retry = RetryConfig {
            base_ms: 1_000,
            max_ms: 60_000,
            max_attempts: 10,
        };
        assert_eq!(failure_backoff(0, retry), Duration::ZERO);
        assert_eq!(failure_backoff(1, retry), Duration::from_millis(1_000));
        assert_eq!(failure_backoff(3, retry), Duration::from_millis(4_000));
        assert_eq!(failure_backoff(12, retry), Duration::from_millis(60_000));
        assert_eq!(failure_backoff(u32::MAX, retry), Duration::from_millis(60_000));
    }

    #[test]
    fn projection_uses_wire_field_names() {
        let outbound = OutboundEvent {
            queue_id: 7,
            retry_count: 0,
            event: StandardEvent {
                event_id: "abc123".to_owned(),
                device_id: "dev_x".to_owned(),
                external_user_id: "u1".to_owned(),
                timestamp: Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap(),
                event_type: EventType::Entry,
                is_simulated: false,
                raw_data: serde_json::Map::new(),
            },
        };
        let value = projection(&outbound);
        assert_eq!(value["eventId"], "abc123");
        assert_eq!(value["deviceId"], "dev_x");
        assert_eq!(value["eventType"], "entry");
        assert_eq!(value["isSimulated"], false);
        assert!(value["timestamp"].as_str().unwrap().starts_with("2026-03-14T09:26:53"));
    }
}
