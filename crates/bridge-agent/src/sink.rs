//! The adapter-facing event sink.
//!
//! Adapters hand events to this sink and move on; everything that can go
//! wrong downstream — a full queue, a storage failure — is absorbed here
//! with a counter and a log line. A misbehaving queue must never crash a
//! driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bridge_adapters::EventSink;
use bridge_core::error::{ProcessorError, QueueError};
use bridge_core::event::RawHardwareEvent;
use bridge_core::processor::EventProcessor;

/// Sink wired into every adapter runner.
pub struct ProcessorSink {
    processor: Arc<EventProcessor>,
    dropped: AtomicU64,
}

impl ProcessorSink {
    #[must_use]
    pub fn new(processor: Arc<EventProcessor>) -> Self {
        Self {
            processor,
            dropped: AtomicU64::new(0),
        }
    }

    /// Events dropped because the queue refused them.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl EventSink for ProcessorSink {
    async fn push(&self, event: RawHardwareEvent) {
        let adapter = event.adapter_name.clone();
        match self.processor.process(event).await {
            Ok(_) => {}
            Err(ProcessorError::Queue(QueueError::Full)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(adapter = %adapter, "queue full, event dropped");
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(adapter = %adapter, error = %e, "event pipeline failure, event dropped");
            }
        }
    }
}

impl std::fmt::Debug for ProcessorSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorSink").finish_non_exhaustive()
    }
}
