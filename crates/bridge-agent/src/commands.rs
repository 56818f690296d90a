//! The door-command loop.
//!
//! Long-polls `/api/v1/devices/commands` (the server holds the request up to
//! 25 s) and dispatches `door.unlock` to a door-capable adapter. Command ids
//! are tracked in a bounded recent-set so a replayed command is ignored.
//! Outcomes are queued for the next heartbeat — the command channel itself
//! has no ack leg.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::cloud::{CloudClient, CloudCommand};
use crate::door::DoorController;
use crate::heartbeat::CommandResults;

/// How many command ids the replay guard remembers.
const REPLAY_WINDOW: usize = 128;

/// Pause between polls after an error (offline is normal).
const ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Pause while unpaired.
const UNPAIRED_PAUSE: Duration = Duration::from_secs(10);

/// Bounded set of recently executed command ids.
#[derive(Debug)]
pub struct RecentCommands {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentCommands {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record a command id. Returns `false` if it was already seen (replay).
    pub fn insert(&mut self, command_id: &str) -> bool {
        if self.seen.contains(command_id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(command_id.to_owned());
        self.order.push_back(command_id.to_owned());
        true
    }
}

/// Run the command long-poll loop until shutdown.
pub async fn run_command_loop(
    cloud: Arc<CloudClient>,
    door: Arc<DoorController>,
    results: Arc<CommandResults>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut recent = RecentCommands::new(REPLAY_WINDOW);
    tracing::info!("command loop started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        if !cloud.is_paired().await {
            tokio::select! {
                () = tokio::time::sleep(UNPAIRED_PAUSE) => {}
                _ = shutdown.changed() => {}
            }
            continue;
        }

        let commands = tokio::select! {
            result = cloud.poll_commands() => result,
            _ = shutdown.changed() => continue,
        };

        match commands {
            Ok(commands) => {
                for command in commands {
                    handle_command(&door, &results, &mut recent, command).await;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "command poll failed, pausing");
                tokio::select! {
                    () = tokio::time::sleep(ERROR_PAUSE) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    tracing::info!("command loop stopped");
}

async fn handle_command(
    door: &DoorController,
    results: &CommandResults,
    recent: &mut RecentCommands,
    command: CloudCommand,
) {
    if !recent.insert(&command.command_id) {
        tracing::warn!(command_id = %command.command_id, "replayed command ignored");
        return;
    }

    match command.kind.as_str() {
        "door.unlock" => {
            let outcome = door
                .unlock(
                    command.payload.adapter_name.as_deref(),
                    command.payload.duration_ms,
                )
                .await;
            match outcome {
                Ok(unlocked) => {
                    results
                        .record(
                            &command.command_id,
                            true,
                            &format!("unlocked via {} for {}ms", unlocked.adapter, unlocked.duration_ms),
                        )
                        .await;
                }
                Err(e) => {
                    tracing::warn!(command_id = %command.command_id, error = %e, "unlock command failed");
                    results.record(&command.command_id, false, &e.to_string()).await;
                }
            }
        }
        other => {
            tracing::warn!(command_id = %command.command_id, kind = %other, "unknown command type");
            results
                .record(&command.command_id, false, &format!("unknown command type '{other}'"))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replayed_ids_are_rejected() {
        let mut recent = RecentCommands::new(8);
        assert!(recent.insert("cmd-1"));
        assert!(!recent.insert("cmd-1"));
        assert!(recent.insert("cmd-2"));
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut recent = RecentCommands::new(2);
        assert!(recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(recent.insert("c")); // evicts "a"
        assert!(recent.insert("a")); // no longer remembered
        assert!(!recent.insert("c"));
    }
}
