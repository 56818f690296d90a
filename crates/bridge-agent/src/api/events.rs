//! Recent-event and dead-letter inspection endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use super::ApiState;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    limit: Option<usize>,
    cursor: Option<u64>,
    /// Unix milliseconds; events older than this are skipped.
    since: Option<i64>,
}

/// `GET /api/v1/events?limit&cursor&since` — paginated queue contents,
/// newest first, any status.
pub async fn recent(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let (entries, next_cursor) = state
        .queue
        .recent(limit, query.cursor, query.since)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(json!({
        "events": entries,
        "nextCursor": next_cursor,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    limit: Option<usize>,
}

/// `GET /api/v1/deadletter?limit` — tail of the eviction log.
pub async fn deadletter_tail(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let entries = state
        .dead_letter
        .tail(limit)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "entries": entries })))
}
