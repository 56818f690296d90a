//! Agent wiring scenarios: the simulator feeding the real pipeline through
//! the sink, runtime enable/disable, and unlock dispatch through the fleet.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bridge_adapters::runner::BackoffPolicy;
use bridge_adapters::{AdapterState, EventSink};
use bridge_agent::door::DoorController;
use bridge_agent::fleet::AdapterSet;
use bridge_agent::sink::ProcessorSink;
use bridge_core::config::BridgeConfig;
use bridge_core::crypto::EncryptionKey;
use bridge_core::deadletter::DeadLetterLog;
use bridge_core::processor::EventProcessor;
use bridge_core::queue::DurableQueue;
use bridge_storage::MemoryEventStore;

async fn pipeline(dir: &tempfile::TempDir) -> (Arc<DurableQueue>, Arc<EventProcessor>) {
    let queue = Arc::new(
        DurableQueue::open(
            Arc::new(MemoryEventStore::new()),
            Arc::new(DeadLetterLog::new(dir.path().join("deadletter.jsonl"))),
            EncryptionKey::generate(),
            10_000,
            Duration::from_secs(300),
            10,
        )
        .await
        .unwrap(),
    );
    let processor = Arc::new(EventProcessor::new(Arc::clone(&queue), "dev_x".to_owned(), 300));
    (queue, processor)
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(1),
        max: Duration::from_millis(10),
    }
}

fn simulator_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.enabled_adapters = vec!["simulator".to_owned()];
    config.adapter_configs.insert(
        "simulator".to_owned(),
        serde_json::json!({ "interval_ms": 10, "users": ["a", "b"] }),
    );
    config
}

#[tokio::test]
async fn simulator_events_flow_into_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let (queue, processor) = pipeline(&dir).await;
    let sink = Arc::new(ProcessorSink::new(processor));
    let adapters = Arc::new(AdapterSet::new(sink as Arc<dyn EventSink>, fast_backoff()));

    adapters.start_from_config(&simulator_config()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = queue.stats().await.unwrap();
    assert!(stats.pending >= 1, "simulator should have queued events");

    // Everything it queued is flagged as simulated.
    let (views, _) = queue.recent(10, None, None).await.unwrap();
    assert!(views.iter().all(|v| v.event.is_simulated));

    adapters.stop_all(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn disable_stops_the_event_flow_and_enable_resumes_it() {
    let dir = tempfile::tempdir().unwrap();
    let (queue, processor) = pipeline(&dir).await;
    let sink = Arc::new(ProcessorSink::new(processor));
    let adapters = Arc::new(AdapterSet::new(sink as Arc<dyn EventSink>, fast_backoff()));

    adapters.start_from_config(&simulator_config()).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    adapters.disable("simulator").await.unwrap();
    assert!(!adapters.is_enabled("simulator").await);

    let settled = queue.stats().await.unwrap().pending;
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(queue.stats().await.unwrap().pending, settled);

    adapters.enable("simulator").await.unwrap();
    assert!(adapters.is_enabled("simulator").await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let health = adapters.health().await;
    assert_eq!(health.len(), 1);
    assert_ne!(health[0].state, AdapterState::Idle);

    adapters.stop_all(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn unknown_adapter_names_warn_but_do_not_fail_startup() {
    let dir = tempfile::tempdir().unwrap();
    let (_queue, processor) = pipeline(&dir).await;
    let sink = Arc::new(ProcessorSink::new(processor));
    let adapters = Arc::new(AdapterSet::new(sink as Arc<dyn EventSink>, fast_backoff()));

    let mut config = simulator_config();
    config.enabled_adapters.push("suprema".to_owned());
    adapters.start_from_config(&config).await;

    // Only the known adapter is managed.
    let health = adapters.health().await;
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].name, "simulator");

    adapters.stop_all(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn unlock_routes_to_the_door_capable_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let (_queue, processor) = pipeline(&dir).await;
    let sink = Arc::new(ProcessorSink::new(processor));
    let adapters = Arc::new(AdapterSet::new(sink as Arc<dyn EventSink>, fast_backoff()));
    adapters.start_from_config(&simulator_config()).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let door = DoorController::new(Arc::clone(&adapters), 3_000);
    let outcome = door.unlock(None, Some(2_000)).await.unwrap();
    assert_eq!(outcome.adapter, "simulator");
    assert_eq!(outcome.duration_ms, 2_000);

    // Default duration applies when the caller does not name one.
    let outcome = door.unlock(Some("simulator"), None).await.unwrap();
    assert_eq!(outcome.duration_ms, 3_000);

    adapters.stop_all(Duration::from_secs(2)).await;
}
