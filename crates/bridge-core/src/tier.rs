//! Performance tiers: a coarse resource class that selects operational
//! parameters.
//!
//! The health sampler reads memory, CPU, and disk every 30 seconds, computes
//! a [`Tier`], and feeds it through a [`TierTracker`] so that one outlier
//! sample never flips the tier — three consecutive samples must agree. On a
//! transition the supervisor publishes fresh [`TierParams`] to the queue,
//! the submission service, and the heartbeat loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BridgeConfig;

/// Consecutive agreeing samples required before a tier transition.
pub const DEBOUNCE_SAMPLES: u32 = 3;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Resource class of the host, from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Lite,
    Normal,
    Full,
}

impl Tier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lite => "lite",
            Self::Normal => "normal",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reading from the health sampler.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub available_memory_bytes: u64,
    /// 1-minute CPU average, 0–100.
    pub cpu_percent: f32,
    /// Free space on the data partition.
    pub disk_free_bytes: u64,
}

/// Derive the tier for a sample.
///
/// Lite when memory is scarce or the CPU is pinned; full only when memory,
/// CPU, and disk are all comfortable; normal otherwise.
#[must_use]
pub fn compute_tier(sample: &ResourceSample) -> Tier {
    if sample.available_memory_bytes < 512 * MIB || sample.cpu_percent > 80.0 {
        return Tier::Lite;
    }
    if sample.available_memory_bytes > 2 * GIB
        && sample.cpu_percent < 40.0
        && sample.disk_free_bytes > 2 * GIB
    {
        return Tier::Full;
    }
    Tier::Normal
}

/// Operational parameters selected by a tier, after config overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierParams {
    pub tier: Tier,
    pub queue_max_size: u64,
    pub batch_size: u32,
    pub submit_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl TierParams {
    /// Resolve the parameters for `tier` under the given config.
    ///
    /// `submit.batch_size` and `heartbeat_interval` override the tier table
    /// when set; the lite tier trims the queue bound to a quarter of the
    /// configured size so a starved host is not asked to hold the full
    /// backlog.
    #[must_use]
    pub fn for_tier(tier: Tier, config: &BridgeConfig) -> Self {
        let (batch, submit_secs, heartbeat_secs) = match tier {
            Tier::Lite => (10, 60, 300),
            Tier::Normal => (50, 30, 60),
            Tier::Full => (100, 15, 30),
        };
        let queue_max_size = match tier {
            Tier::Lite => (config.queue_max_size / 4).max(1),
            Tier::Normal | Tier::Full => config.queue_max_size,
        };
        Self {
            tier,
            queue_max_size,
            batch_size: config.submit.batch_size.unwrap_or(batch),
            submit_interval: Duration::from_secs(submit_secs),
            heartbeat_interval: Duration::from_secs(
                config.heartbeat_interval.unwrap_or(heartbeat_secs),
            ),
        }
    }
}

/// Debounces tier transitions: a change is applied only after
/// [`DEBOUNCE_SAMPLES`] consecutive samples agree on the new tier.
#[derive(Debug)]
pub struct TierTracker {
    current: Tier,
    candidate: Option<Tier>,
    agreement: u32,
}

impl TierTracker {
    #[must_use]
    pub fn new(initial: Tier) -> Self {
        Self {
            current: initial,
            candidate: None,
            agreement: 0,
        }
    }

    /// The active tier.
    #[must_use]
    pub fn current(&self) -> Tier {
        self.current
    }

    /// Feed one sample's tier. Returns `Some(new_tier)` when the debounced
    /// transition fires.
    pub fn observe(&mut self, observed: Tier) -> Option<Tier> {
        if observed == self.current {
            self.candidate = None;
            self.agreement = 0;
            return None;
        }

        if self.candidate == Some(observed) {
            self.agreement += 1;
        } else {
            self.candidate = Some(observed);
            self.agreement = 1;
        }

        if self.agreement >= DEBOUNCE_SAMPLES {
            self.current = observed;
            self.candidate = None;
            self.agreement = 0;
            return Some(observed);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(mem_mib: u64, cpu: f32, disk_gib: u64) -> ResourceSample {
        ResourceSample {
            available_memory_bytes: mem_mib * MIB,
            cpu_percent: cpu,
            disk_free_bytes: disk_gib * GIB,
        }
    }

    #[test]
    fn tier_thresholds() {
        assert_eq!(compute_tier(&sample(256, 10.0, 50)), Tier::Lite);
        assert_eq!(compute_tier(&sample(4096, 90.0, 50)), Tier::Lite);
        assert_eq!(compute_tier(&sample(4096, 20.0, 50)), Tier::Full);
        assert_eq!(compute_tier(&sample(1024, 20.0, 50)), Tier::Normal);
        // Plenty of memory and CPU but a full disk is not "full" tier.
        assert_eq!(compute_tier(&sample(4096, 20.0, 1)), Tier::Normal);
    }

    #[test]
    fn single_outlier_does_not_flip_tier() {
        let mut tracker = TierTracker::new(Tier::Normal);
        assert_eq!(tracker.observe(Tier::Lite), None);
        assert_eq!(tracker.observe(Tier::Normal), None);
        assert_eq!(tracker.current(), Tier::Normal);
    }

    #[test]
    fn three_consecutive_samples_flip_tier() {
        let mut tracker = TierTracker::new(Tier::Normal);
        assert_eq!(tracker.observe(Tier::Full), None);
        assert_eq!(tracker.observe(Tier::Full), None);
        assert_eq!(tracker.observe(Tier::Full), Some(Tier::Full));
        assert_eq!(tracker.current(), Tier::Full);
    }

    #[test]
    fn candidate_switch_restarts_the_count() {
        let mut tracker = TierTracker::new(Tier::Normal);
        tracker.observe(Tier::Full);
        tracker.observe(Tier::Full);
        // A different candidate resets agreement.
        assert_eq!(tracker.observe(Tier::Lite), None);
        assert_eq!(tracker.observe(Tier::Lite), None);
        assert_eq!(tracker.observe(Tier::Lite), Some(Tier::Lite));
    }

    #[test]
    fn params_follow_the_tier_table() {
        let config = BridgeConfig::default();
        let normal = TierParams::for_tier(Tier::Normal, &config);
        assert_eq!(normal.batch_size, 50);
        assert_eq!(normal.submit_interval, Duration::from_secs(30));
        assert_eq!(normal.heartbeat_interval, Duration::from_secs(60));
        assert_eq!(normal.queue_max_size, config.queue_max_size);

        let lite = TierParams::for_tier(Tier::Lite, &config);
        assert_eq!(lite.batch_size, 10);
        assert_eq!(lite.queue_max_size, config.queue_max_size / 4);
    }

    #[test]
    fn config_knobs_override_the_table() {
        let mut config = BridgeConfig::default();
        config.submit.batch_size = Some(25);
        config.heartbeat_interval = Some(120);
        let params = TierParams::for_tier(Tier::Full, &config);
        assert_eq!(params.batch_size, 25);
        assert_eq!(params.heartbeat_interval, Duration::from_secs(120));
    }
}
