//! Config read/update endpoints.
//!
//! `GET` returns the active snapshot (identity is never part of it — the
//! credential store owns that, and `save` strips the legacy fields anyway).
//! `PUT` updates the hot-reloadable subset in memory; `server_url`, storage
//! paths, and identity are read-only here. `POST` persists the active
//! snapshot to the config file.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use serde_json::{Value, json};

use bridge_core::config::BridgeConfig;

use super::ApiState;
use crate::error::ApiError;

/// `GET /api/v1/config`.
pub async fn read(State(state): State<Arc<ApiState>>) -> Result<Json<Value>, ApiError> {
    let config = state.config();
    let value = serde_json::to_value(&*config)
        .map_err(|e| ApiError::Internal(format!("config serialize: {e}")))?;
    Ok(Json(value))
}

/// `PUT /api/v1/config` — merge a partial update into the snapshot.
///
/// The update is applied field-wise over the current snapshot, then
/// validated and checked against the frozen options before publishing.
pub async fn update(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.require_auth(&headers, &body)?;

    let patch: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))?;
    if !patch.is_object() {
        return Err(ApiError::BadRequest("body must be a JSON object".to_owned()));
    }

    let current = state.config();
    let mut merged = serde_json::to_value(&*current)
        .map_err(|e| ApiError::Internal(format!("config serialize: {e}")))?;
    merge_objects(&mut merged, &patch);

    let next: BridgeConfig = serde_json::from_value(merged)
        .map_err(|e| ApiError::BadRequest(format!("invalid config: {e}")))?;
    next.validate()?;
    next.ensure_reloadable_from(&current)?;

    state.queue.set_max_size(next.queue_max_size);
    state.door.set_default_duration_ms(next.unlock_duration_ms);
    state.config_tx.send_modify(|config| {
        *config = Arc::new(next.clone());
    });
    tracing::info!("config snapshot updated via local api");

    Ok(Json(json!({ "updated": true })))
}

/// `POST /api/v1/config` — persist the active snapshot to disk.
pub async fn persist(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.require_auth(&headers, &body)?;

    let Some(path) = &state.config_path else {
        return Err(ApiError::Conflict(
            "no config file path — started without --config".to_owned(),
        ));
    };
    let config = state.config();
    config.save(path)?;
    tracing::info!(path = %path.display(), "config persisted");
    Ok(Json(json!({ "persisted": true, "path": path.display().to_string() })))
}

/// Shallow-merge `patch` into `base`, recursing one level into objects so
/// `{"retry": {"base_ms": 500}}` does not wipe the other retry fields.
fn merge_objects(base: &mut Value, patch: &Value) {
    let (Some(base_map), Some(patch_map)) = (base.as_object_mut(), patch.as_object()) else {
        return;
    };
    for (key, patch_value) in patch_map {
        match (base_map.get_mut(key), patch_value) {
            (Some(base_value @ Value::Object(_)), Value::Object(_)) => {
                merge_objects(base_value, patch_value);
            }
            _ => {
                base_map.insert(key.clone(), patch_value.clone());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn merge_preserves_sibling_fields() {
        let mut base = serde_json::json!({
            "retry": { "base_ms": 1000, "max_ms": 60000, "max_attempts": 10 },
            "queue_max_size": 10000,
        });
        let patch = serde_json::json!({ "retry": { "base_ms": 500 } });
        merge_objects(&mut base, &patch);
        assert_eq!(base["retry"]["base_ms"], 500);
        assert_eq!(base["retry"]["max_ms"], 60000);
        assert_eq!(base["queue_max_size"], 10000);
    }

    #[test]
    fn merge_replaces_scalars_and_arrays() {
        let mut base = serde_json::json!({ "enabled_adapters": ["simulator"] });
        let patch = serde_json::json!({ "enabled_adapters": ["zkteco", "essl"] });
        merge_objects(&mut base, &patch);
        assert_eq!(base["enabled_adapters"], serde_json::json!(["zkteco", "essl"]));
    }
}
