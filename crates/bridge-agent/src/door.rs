//! Door-unlock dispatch, shared by cloud commands and the local API.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bridge_core::error::CommandError;

use crate::fleet::AdapterSet;

/// Outcome reported back to the caller (and to the cloud via heartbeat).
#[derive(Debug, Clone, serde::Serialize)]
pub struct UnlockOutcome {
    pub adapter: String,
    pub duration_ms: u64,
}

/// Routes unlock requests to a door-capable adapter.
pub struct DoorController {
    adapters: Arc<AdapterSet>,
    default_duration_ms: AtomicU64,
}

impl DoorController {
    #[must_use]
    pub fn new(adapters: Arc<AdapterSet>, default_duration_ms: u64) -> Self {
        Self {
            adapters,
            default_duration_ms: AtomicU64::new(default_duration_ms.max(1)),
        }
    }

    /// Update the default pulse length (config reload, cloud override).
    pub fn set_default_duration_ms(&self, duration_ms: u64) {
        self.default_duration_ms
            .store(duration_ms.max(1), Ordering::Relaxed);
    }

    /// Unlock via the named adapter, or the first door-capable one.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NoDoorAdapter`] / [`CommandError::UnknownCommand`]
    ///   when no suitable adapter exists.
    /// - [`CommandError::Unlock`] when the adapter reports failure.
    pub async fn unlock(
        &self,
        adapter_name: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Result<UnlockOutcome, CommandError> {
        let duration_ms = duration_ms.unwrap_or_else(|| {
            self.default_duration_ms.load(Ordering::Relaxed)
        });
        let adapter = self.adapters.unlock_target(adapter_name).await?;
        let name = adapter.info().name.to_owned();

        adapter
            .unlock(Duration::from_millis(duration_ms))
            .await
            .map_err(|e| CommandError::Unlock {
                adapter: name.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(adapter = %name, duration_ms, "door unlocked");
        Ok(UnlockOutcome {
            adapter: name,
            duration_ms,
        })
    }
}

impl std::fmt::Debug for DoorController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoorController")
            .field(
                "default_duration_ms",
                &self.default_duration_ms.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}
