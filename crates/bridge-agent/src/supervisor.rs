//! The supervisor: single entry point for start, stop, and reload.
//!
//! Start wires the pipeline in dependency order — config, identity, queue,
//! processor, cloud client, adapters, then the background loops and the
//! local API. Config, identity, or queue failures are fatal; a single
//! adapter failing to come up is not.
//!
//! Stop is two-phase: adapters first (no new events), then a bounded grace
//! for the submission service to drain, then the remaining loops and the
//! API listener. The whole sequence runs under a hard ceiling; exceeding it
//! aborts everything with a "dirty shutdown" log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use bridge_adapters::runner::BackoffPolicy;
use bridge_core::config::BridgeConfig;
use bridge_core::crypto::{self, EncryptionKey};
use bridge_core::deadletter::DeadLetterLog;
use bridge_core::error::IdentityError;
use bridge_core::identity::{self, CredentialStore, DeviceIdentity};
use bridge_core::processor::EventProcessor;
use bridge_core::queue::{self, DurableQueue};
use bridge_core::tier::{Tier, TierParams};
use bridge_storage::RedbEventStore;

use crate::api;
use crate::cloud::CloudClient;
use crate::commands::run_command_loop;
use crate::door::DoorController;
use crate::fleet::AdapterSet;
use crate::health::run_health_sampler;
use crate::heartbeat::{CommandResults, run_heartbeat_loop};
use crate::sink::ProcessorSink;
use crate::submit::{SubmitCounters, run_submission_loop};

/// Grace period for the submission service to drain during shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(15);

/// Hard ceiling for the whole shutdown sequence.
const SHUTDOWN_CEILING: Duration = Duration::from_secs(45);

/// Grace for adapters to wind down in phase one.
const ADAPTER_STOP_GRACE: Duration = Duration::from_secs(10);

/// Compactor cadence (the queue itself enforces retention windows).
const COMPACTION_INTERVAL: Duration = Duration::from_secs(60);

/// A running Bridge.
pub struct Bridge {
    shutdown_tx: watch::Sender<bool>,
    adapters: Arc<AdapterSet>,
    queue: Arc<DurableQueue>,
    door: Arc<DoorController>,
    config_tx: watch::Sender<Arc<BridgeConfig>>,
    config_path: Option<PathBuf>,
    submission: Option<JoinHandle<()>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Bridge {
    /// Start everything. Fatal on config, identity-corruption, or queue
    /// errors; per-adapter failures only log.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first fatal startup failure.
    pub async fn start(
        config: BridgeConfig,
        config_path: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let started_at = Instant::now();

        // (2) Resolve the device identity; missing is unpaired mode, corrupt
        // is fatal.
        let store = Arc::new(CredentialStore::new().context("credential store init")?);
        let identity = match store.resolve(&config).await {
            Ok(identity) => identity,
            Err(e @ IdentityError::Corrupt { .. }) => {
                return Err(anyhow::Error::new(e).context("device identity is corrupt"));
            }
            Err(e) => {
                tracing::warn!(error = %e, "credential store unavailable, starting unpaired");
                None
            }
        };
        if identity.is_none() {
            tracing::warn!("no device identity — running unpaired: events queue locally, submission paused");
        }

        // (3) Open the durable queue.
        let (queue, dead_letter) = open_queue(&config, identity.as_ref())
            .await
            .with_context(|| {
                format!(
                    "queue store at '{}' could not be opened — inspect or remove the database",
                    config.database_path.display()
                )
            })?;

        // (4) The processor, bound to the device id (empty while unpaired).
        let device_id = identity
            .as_ref()
            .map(|i| i.device_id.clone())
            .unwrap_or_default();
        let processor = Arc::new(EventProcessor::new(
            Arc::clone(&queue),
            device_id,
            config.dedup.window_seconds,
        ));

        // (5) Cloud client.
        let cloud = Arc::new(
            CloudClient::new(
                config.server_url.clone(),
                Arc::clone(&store),
                payload_key_path(&config),
            )
            .context("cloud client init")?,
        );
        if let Some(identity) = &identity {
            cloud.install_identity(identity).await;
        }

        // (6) Adapters, each supervised and individually non-fatal.
        let sink = Arc::new(ProcessorSink::new(Arc::clone(&processor)));
        let backoff = BackoffPolicy {
            base: Duration::from_millis(config.retry.base_ms),
            max: Duration::from_millis(config.retry.max_ms),
        };
        let adapters = Arc::new(AdapterSet::new(
            Arc::clone(&sink) as Arc<dyn bridge_adapters::EventSink>,
            backoff,
        ));
        adapters.start_from_config(&config).await;

        let door = Arc::new(DoorController::new(
            Arc::clone(&adapters),
            config.unlock_duration_ms,
        ));

        // (7) Background loops.
        let initial_tier = config.tier.fixed().unwrap_or(Tier::Normal);
        let initial_params = TierParams::for_tier(initial_tier, &config);
        queue.set_max_size(initial_params.queue_max_size);
        let (tier_tx, tier_rx) = watch::channel(initial_params);
        let (config_tx, config_rx) = watch::channel(Arc::new(config.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let submit_counters = Arc::new(SubmitCounters::default());
        let command_results = Arc::new(CommandResults::new());

        let submission = tokio::spawn(run_submission_loop(
            Arc::clone(&queue),
            Arc::clone(&cloud),
            tier_rx.clone(),
            config.retry,
            Arc::clone(&submit_counters),
            shutdown_rx.clone(),
        ));

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        tasks.push((
            "heartbeat",
            tokio::spawn(run_heartbeat_loop(
                Arc::clone(&cloud),
                Arc::clone(&queue),
                Arc::clone(&processor),
                Arc::clone(&adapters),
                Arc::clone(&door),
                tier_rx.clone(),
                Arc::clone(&command_results),
                started_at,
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "commands",
            tokio::spawn(run_command_loop(
                Arc::clone(&cloud),
                Arc::clone(&door),
                Arc::clone(&command_results),
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "health",
            tokio::spawn(run_health_sampler(
                config_rx.clone(),
                tier_tx,
                Arc::clone(&queue),
                initial_tier,
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "compactor",
            tokio::spawn(run_compactor(Arc::clone(&queue), shutdown_rx.clone())),
        ));

        // (8) Local control API.
        if config.api_server.enabled {
            let state = api::build_state(
                started_at,
                Arc::clone(&queue),
                Arc::clone(&processor),
                Arc::clone(&adapters),
                Arc::clone(&cloud),
                Arc::clone(&door),
                dead_letter,
                Arc::clone(&submit_counters),
                sink,
                config_tx.clone(),
                config_path.clone(),
                tier_rx,
            );
            let router = api::build_router(state);
            let addr = format!("{}:{}", config.api_server.host, config.api_server.port);
            let listener = TcpListener::bind(&addr)
                .await
                .with_context(|| format!("local api failed to bind {addr}"))?;
            tracing::info!(addr = %addr, "local control api listening");

            let mut api_shutdown = shutdown_rx.clone();
            tasks.push((
                "local-api",
                tokio::spawn(async move {
                    let graceful = async move {
                        while !*api_shutdown.borrow() {
                            if api_shutdown.changed().await.is_err() {
                                break;
                            }
                        }
                    };
                    if let Err(e) = axum::serve(listener, router)
                        .with_graceful_shutdown(graceful)
                        .await
                    {
                        tracing::error!(error = %e, "local api server error");
                    }
                }),
            ));
        }

        tracing::info!(
            version = crate::VERSION,
            paired = identity.is_some(),
            tier = %initial_tier,
            "bridge started"
        );
        Ok(Self {
            shutdown_tx,
            adapters,
            queue,
            door,
            config_tx,
            config_path,
            submission: Some(submission),
            tasks,
        })
    }

    /// Reload the config file and publish a new snapshot. Frozen options
    /// (`server_url`, storage paths) refuse to change.
    ///
    /// # Errors
    ///
    /// Returns the config error; the previous snapshot stays active.
    pub async fn reload(&self, permissive: bool) -> anyhow::Result<()> {
        let Some(path) = &self.config_path else {
            anyhow::bail!("started without --config, nothing to reload");
        };
        let next = BridgeConfig::load(Some(path), permissive).context("reload config")?;
        let current = self.config_tx.borrow().clone();
        next.ensure_reloadable_from(&current)
            .context("reload rejected")?;

        // Apply adapter set changes: start the newly enabled, stop the
        // removed.
        for name in &next.enabled_adapters {
            if !current.enabled_adapters.contains(name) {
                if let Err(e) = self.adapters.enable(name).await {
                    tracing::warn!(adapter = %name, error = %e, "reload: adapter enable failed");
                }
            }
        }
        for name in &current.enabled_adapters {
            if !next.enabled_adapters.contains(name) {
                if let Err(e) = self.adapters.disable(name).await {
                    tracing::warn!(adapter = %name, error = %e, "reload: adapter disable failed");
                }
            }
        }

        self.queue.set_max_size(next.queue_max_size);
        self.door.set_default_duration_ms(next.unlock_duration_ms);
        self.config_tx.send_replace(Arc::new(next));
        tracing::info!("config reloaded");
        Ok(())
    }

    /// Two-phase shutdown under the hard ceiling.
    pub async fn stop(mut self) {
        tracing::info!("bridge stopping");
        let sequence = async {
            // Phase 1: no new events.
            self.adapters.stop_all(ADAPTER_STOP_GRACE).await;

            // Phase 2: let submission drain in-flight work.
            let _ = self.shutdown_tx.send(true);
            if let Some(submission) = self.submission.take() {
                if tokio::time::timeout(DRAIN_GRACE, submission).await.is_err() {
                    tracing::warn!("submission did not drain within grace, aborting");
                }
            }

            // Phase 3: remaining loops and the API listener.
            for (name, task) in self.tasks.drain(..) {
                if tokio::time::timeout(Duration::from_secs(5), task)
                    .await
                    .is_err()
                {
                    tracing::warn!(task = name, "task ignored shutdown within 5s");
                }
            }

            // Final compaction pass before the store closes with the process.
            if let Err(e) = self.queue.compact_once().await {
                tracing::warn!(error = %e, "final compaction failed");
            }
        };

        if tokio::time::timeout(SHUTDOWN_CEILING, sequence).await.is_err() {
            tracing::error!(
                ceiling_secs = SHUTDOWN_CEILING.as_secs(),
                "dirty shutdown: ceiling exceeded, aborting remaining tasks"
            );
            if let Some(submission) = self.submission.take() {
                submission.abort();
            }
            for (_, task) in self.tasks.drain(..) {
                task.abort();
            }
        }
        tracing::info!("bridge stopped");
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").finish_non_exhaustive()
    }
}

/// The wrapped payload-key file sits next to the database.
#[must_use]
pub fn payload_key_path(config: &BridgeConfig) -> PathBuf {
    let mut path = config.database_path.clone().into_os_string();
    path.push(".key");
    PathBuf::from(path)
}

/// The dead-letter log sits next to the database.
#[must_use]
pub fn dead_letter_path(config: &BridgeConfig) -> PathBuf {
    config
        .database_path
        .parent()
        .map_or_else(|| PathBuf::from("deadletter.jsonl"), |p| p.join("deadletter.jsonl"))
}

/// Derive the key-encryption key for the payload key file: the device
/// credential when paired, the machine-bound secret before pairing.
///
/// # Errors
///
/// Returns [`IdentityError`] if derivation fails.
pub fn payload_kek(identity: Option<&DeviceIdentity>) -> Result<EncryptionKey, IdentityError> {
    match identity {
        Some(identity) => Ok(crypto::derive_key(&identity.device_key, "payload-kek")?),
        None => {
            let machine = identity::machine_bound_key()?;
            Ok(crypto::derive_key(machine.as_bytes(), "payload-kek")?)
        }
    }
}

async fn open_queue(
    config: &BridgeConfig,
    identity: Option<&DeviceIdentity>,
) -> anyhow::Result<(Arc<DurableQueue>, Arc<DeadLetterLog>)> {
    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data directory '{}'", parent.display()))?;
        }
    }

    let store = Arc::new(RedbEventStore::open(&config.database_path)?);
    let kek = payload_kek(identity)?;
    let payload_key = queue::load_or_create_payload_key(&payload_key_path(config), &kek)?;
    let dead_letter = Arc::new(DeadLetterLog::new(dead_letter_path(config)));

    let queue = DurableQueue::open(
        store,
        Arc::clone(&dead_letter),
        payload_key,
        config.queue_max_size,
        Duration::from_secs(config.dedup.window_seconds),
        config.retry.max_attempts,
    )
    .await?;
    Ok((Arc::new(queue), dead_letter))
}

async fn run_compactor(queue: Arc<DurableQueue>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            () = tokio::time::sleep(COMPACTION_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            return;
        }
        if let Err(e) = queue.compact_once().await {
            tracing::warn!(error = %e, "compaction pass failed");
        }
    }
}
