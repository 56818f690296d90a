//! `bridge` — the gym edge agent.
//!
//! `bridge run` starts the long-lived service; the other subcommands are
//! operator tooling: pair against the cloud, unpair, query the local API,
//! or fire a one-off heartbeat.
//!
//! Exit codes: 0 success, 1 generic failure, 2 config error, 3 auth error,
//! 4 network error.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use bridge_agent::cloud::{CloudClient, DeviceInfo};
use bridge_agent::supervisor::{Bridge, payload_key_path};
use bridge_core::config::BridgeConfig;
use bridge_core::error::{AuthError, ConfigError, IdentityError};
use bridge_core::identity::CredentialStore;
use bridge_core::queue::rewrap_payload_key;
use bridge_core::tier::Tier;
use bridge_agent::error::CloudError;

const EXIT_GENERIC: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_AUTH: u8 = 3;
const EXIT_NETWORK: u8 = 4;

/// The Bridge — connects gym access hardware to the cloud.
#[derive(Parser)]
#[command(
    name = "bridge",
    version,
    about = "Gym edge agent: forwards access events, executes door commands",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, global = true, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Accept unknown config keys instead of refusing to start.
    #[arg(long, global = true, default_value = "false")]
    permissive: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent (default).
    Run,
    /// Pair this bridge with the cloud using a one-time code.
    Pair {
        /// The pair code shown in the dashboard.
        #[arg(long)]
        pair_code: String,
    },
    /// Remove the stored device identity.
    Unpair {
        /// Skip the confirmation prompt.
        #[arg(long, default_value = "false")]
        force: bool,
    },
    /// Query the running agent's status over the local API.
    Status {
        /// Print raw JSON instead of a summary.
        #[arg(long, default_value = "false")]
        json: bool,
    },
    /// Send one heartbeat to the cloud immediately.
    TriggerHeartbeat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match BridgeConfig::load(cli.config.as_deref(), cli.permissive) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, cli.config, cli.permissive).await,
        Command::Pair { pair_code } => pair(&config, &pair_code).await,
        Command::Unpair { force } => unpair(force).await,
        Command::Status { json } => status(&config, json).await,
        Command::TriggerHeartbeat => trigger_heartbeat(&config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(classify(&e))
        }
    }
}

/// Map an error chain to the documented exit codes.
fn classify(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return EXIT_CONFIG;
        }
        if cause.downcast_ref::<AuthError>().is_some()
            || cause.downcast_ref::<IdentityError>().is_some()
        {
            return EXIT_AUTH;
        }
        if let Some(cloud) = cause.downcast_ref::<CloudError>() {
            return match cloud {
                CloudError::Network { .. } => EXIT_NETWORK,
                CloudError::Status { status: 401 | 403, .. }
                | CloudError::Unpaired
                | CloudError::Auth(_)
                | CloudError::Identity(_) => EXIT_AUTH,
                _ => EXIT_GENERIC,
            };
        }
        if cause.downcast_ref::<reqwest::Error>().is_some() {
            return EXIT_NETWORK;
        }
    }
    EXIT_GENERIC
}

/// Initialize logging: JSON to stderr, or to `log_file` when configured.
/// Returns the appender guard which must stay alive for the process.
fn init_logging(config: &BridgeConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    if let Some(log_file) = &config.log_file {
        let directory = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = log_file
            .file_name()
            .map_or_else(|| "bridge.log".to_owned(), |n| n.to_string_lossy().into_owned());
        let appender = tracing_appender::rolling::daily(directory, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .json()
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
        None
    }
}

/// `bridge run` — start the supervisor and wait for a stop signal.
async fn run(
    config: BridgeConfig,
    config_path: Option<PathBuf>,
    permissive: bool,
) -> anyhow::Result<()> {
    let _log_guard = init_logging(&config);
    let bridge = Bridge::start(config, config_path).await?;

    wait_for_shutdown(&bridge, permissive).await;
    bridge.stop().await;
    Ok(())
}

/// Block until SIGINT/SIGTERM; SIGHUP reloads the config in place.
async fn wait_for_shutdown(bridge: &Bridge, permissive: bool) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).ok();
        let mut hup = signal(SignalKind::hangup()).ok();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return,
                _ = async {
                    match term.as_mut() {
                        Some(sig) => { sig.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => return,
                _ = async {
                    match hup.as_mut() {
                        Some(sig) => { sig.recv().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if let Err(e) = bridge.reload(permissive).await {
                        tracing::error!(error = %e, "config reload failed, keeping previous config");
                    }
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (bridge, permissive);
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// `bridge pair --pair-code X`.
async fn pair(config: &BridgeConfig, pair_code: &str) -> anyhow::Result<()> {
    let store = Arc::new(CredentialStore::new()?);
    if store.get().await?.is_some() {
        anyhow::bail!("this bridge is already paired — run `bridge unpair` first");
    }

    let key_path = payload_key_path(config);
    let cloud = CloudClient::new(config.server_url.clone(), Arc::clone(&store), key_path.clone())?;
    let info = DeviceInfo {
        hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_owned()),
        platform: std::env::consts::OS.to_owned(),
        version: bridge_agent::VERSION.to_owned(),
        tier: config.tier.fixed().unwrap_or(Tier::Normal),
    };

    let (identity, overrides) = cloud.pair(pair_code, &info).await?;
    store.set(&identity).await?;

    // Events queued while unpaired were sealed under the machine-bound key;
    // move the wrapped payload key under the new device credential.
    if key_path.exists() {
        let old_kek = bridge_agent::supervisor::payload_kek(None)?;
        let new_kek = bridge_agent::supervisor::payload_kek(Some(&identity))?;
        rewrap_payload_key(&key_path, &old_kek, &new_kek)
            .context("re-wrapping queue payload key")?;
    }

    println!("paired as {} (key version {})", identity.device_id, identity.key_version);
    if overrides != Default::default() {
        println!("cloud config overrides will apply on next start");
    }
    Ok(())
}

/// `bridge unpair [--force]`.
async fn unpair(force: bool) -> anyhow::Result<()> {
    let store = CredentialStore::new()?;
    let Some(identity) = store.get().await? else {
        println!("not paired — nothing to do");
        return Ok(());
    };

    if !force {
        print!("remove identity for {}? [y/N] ", identity.device_id);
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer).ok();
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("aborted");
            return Ok(());
        }
    }

    store.clear().await?;
    println!("unpaired — queued events remain on disk until re-pairing");
    Ok(())
}

/// `bridge status [--json]` — read the running agent's local API.
async fn status(config: &BridgeConfig, json: bool) -> anyhow::Result<()> {
    let url = format!(
        "http://{}:{}/api/v1/status",
        config.api_server.host, config.api_server.port
    );
    let value: serde_json::Value = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("is the agent running? GET {url}"))?
        .json()
        .await
        .context("status response")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("bridge {}", value["version"].as_str().unwrap_or("?"));
    println!(
        "  paired:    {} ({})",
        value["paired"],
        value["deviceId"].as_str().unwrap_or("-")
    );
    println!("  tier:      {}", value["tier"].as_str().unwrap_or("?"));
    println!(
        "  queue:     {} pending / {} in-flight / {} failed",
        value["queue"]["stats"]["pending"],
        value["queue"]["stats"]["in_flight"],
        value["queue"]["stats"]["failed"],
    );
    println!(
        "  last cloud contact: {}",
        value["lastCloudContact"].as_str().unwrap_or("never")
    );
    if let Some(adapters) = value["adapters"].as_array() {
        println!("  adapters:");
        for adapter in adapters {
            println!(
                "    {:<12} {}",
                adapter["name"].as_str().unwrap_or("?"),
                adapter["state"].as_str().unwrap_or("?"),
            );
        }
    }
    Ok(())
}

/// `bridge trigger-heartbeat` — one signed heartbeat, directly to the cloud.
async fn trigger_heartbeat(config: &BridgeConfig) -> anyhow::Result<()> {
    let store = Arc::new(CredentialStore::new()?);
    let Some(identity) = store.get().await? else {
        return Err(anyhow::Error::new(CloudError::Unpaired));
    };

    let cloud = CloudClient::new(
        identity.server_url.clone(),
        Arc::clone(&store),
        payload_key_path(config),
    )?;
    cloud.install_identity(&identity).await;

    let body = serde_json::json!({
        "deviceId": identity.device_id,
        "tier": config.tier.fixed().unwrap_or(Tier::Normal),
        "uptimeMs": 0,
        "version": bridge_agent::VERSION,
        "trigger": "manual",
    });
    cloud.heartbeat(body).await?;
    println!("heartbeat acknowledged by {}", identity.server_url);
    Ok(())
}
