//! The health sampler: resources → tier.
//!
//! Every 30 s the sampler reads memory, CPU, and free disk on the data
//! partition, computes a tier, and feeds it through the debouncing
//! [`TierTracker`]. On a confirmed transition it publishes fresh
//! [`TierParams`] over the watch channel and adjusts the queue bound.
//! A fixed `tier` config setting pins the tier and skips sampling.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Disks, System};
use tokio::sync::watch;

use bridge_core::config::BridgeConfig;
use bridge_core::queue::DurableQueue;
use bridge_core::tier::{ResourceSample, Tier, TierParams, TierTracker, compute_tier};

/// Sampling cadence.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Read one resource sample. `database_path` selects the disk whose mount
/// point contains the queue database.
fn sample_resources(sys: &mut System, database_path: &Path) -> ResourceSample {
    sys.refresh_memory();
    sys.refresh_cpu_usage();

    let disks = Disks::new_with_refreshed_list();
    let mut disk_free_bytes = 0u64;
    let mut best_match = 0usize;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if database_path.starts_with(mount) && mount.as_os_str().len() >= best_match {
            best_match = mount.as_os_str().len();
            disk_free_bytes = disk.available_space();
        }
    }

    ResourceSample {
        available_memory_bytes: sys.available_memory(),
        cpu_percent: sys.global_cpu_usage(),
        disk_free_bytes,
    }
}

/// Run the sampler loop until shutdown.
pub async fn run_health_sampler(
    config_rx: watch::Receiver<Arc<BridgeConfig>>,
    tier_tx: watch::Sender<TierParams>,
    queue: Arc<DurableQueue>,
    initial_tier: Tier,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = TierTracker::new(initial_tier);
    let mut sys = System::new();
    tracing::info!(tier = %initial_tier, "health sampler started");

    loop {
        tokio::select! {
            () = tokio::time::sleep(SAMPLE_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let config = Arc::clone(&config_rx.borrow());
        if let Some(fixed) = config.tier.fixed() {
            if fixed != tracker.current() {
                tracker = TierTracker::new(fixed);
                publish(&tier_tx, &queue, fixed, &config);
            }
            continue;
        }

        let sample = sample_resources(&mut sys, &config.database_path);
        let observed = compute_tier(&sample);
        tracing::trace!(
            available_mb = sample.available_memory_bytes / (1024 * 1024),
            cpu = sample.cpu_percent,
            disk_free_mb = sample.disk_free_bytes / (1024 * 1024),
            observed = %observed,
            "resource sample"
        );

        if let Some(new_tier) = tracker.observe(observed) {
            tracing::info!(tier = %new_tier, "tier transition");
            publish(&tier_tx, &queue, new_tier, &config);
        }
    }
    tracing::info!("health sampler stopped");
}

fn publish(
    tier_tx: &watch::Sender<TierParams>,
    queue: &DurableQueue,
    tier: Tier,
    config: &BridgeConfig,
) {
    let params = TierParams::for_tier(tier, config);
    queue.set_max_size(params.queue_max_size);
    let _ = tier_tx.send(params);
}
