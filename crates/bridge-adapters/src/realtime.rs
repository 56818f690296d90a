//! Realtime Biometrics adapter: JSON-lines TCP receiver.
//!
//! Realtime controllers push one JSON object per line:
//!
//! ```text
//! {"event":"punch","user":"1042","dir":"in","ts":1767225600}
//! ```
//!
//! `dir` is `in`, `out`, or `deny`. Lines with a different `event` field are
//! device chatter and ignored.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use bridge_core::event::{EventType, RawHardwareEvent};

use crate::{AdapterContext, AdapterError, AdapterInfo, Capability, HardwareAdapter};

pub const NAME: &str = "realtime";

/// `adapter_configs.realtime` block.
#[derive(Debug, Clone, Deserialize)]
struct RealtimeConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
}

fn default_port() -> u16 {
    9922
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// One pushed record as the device serializes it.
#[derive(Debug, Deserialize)]
struct PunchRecord {
    event: String,
    user: String,
    dir: String,
    ts: i64,
}

/// Realtime push-mode driver.
#[derive(Debug, Default)]
pub struct RealtimeAdapter;

/// Parse one JSON line, `None` for chatter or malformed records.
fn parse_line(line: &str) -> Option<RawHardwareEvent> {
    let record: PunchRecord = serde_json::from_str(line.trim()).ok()?;
    if record.event != "punch" || record.user.is_empty() {
        return None;
    }

    let event_type = match record.dir.as_str() {
        "in" => EventType::Entry,
        "out" => EventType::Exit,
        _ => EventType::Denied,
    };
    let timestamp = DateTime::<Utc>::from_timestamp(record.ts, 0)?;

    let mut raw_data = serde_json::Map::new();
    raw_data.insert("dir".to_owned(), serde_json::Value::from(record.dir));
    Some(RawHardwareEvent {
        external_user_id: record.user,
        timestamp,
        event_type,
        raw_data,
        adapter_name: NAME.to_owned(),
    })
}

#[async_trait::async_trait]
impl HardwareAdapter for RealtimeAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: NAME,
            capabilities: vec![Capability::EmitEvents],
        }
    }

    async fn run(&self, mut ctx: AdapterContext) -> Result<(), AdapterError> {
        let config: RealtimeConfig =
            serde_json::from_value(ctx.config.clone()).map_err(|e| AdapterError::Config {
                adapter: NAME.to_owned(),
                reason: format!("host is required: {e}"),
            })?;

        let addr = format!("{}:{}", config.host, config.port);
        let stream = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| AdapterError::Connect {
            adapter: NAME.to_owned(),
            reason: format!("connect to {addr} timed out"),
        })?
        .map_err(|e| AdapterError::Connect {
            adapter: NAME.to_owned(),
            reason: format!("connect to {addr}: {e}"),
        })?;

        ctx.status.report_running().await;
        tracing::info!(addr = %addr, "realtime connected");

        let mut lines = BufReader::new(stream).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_line(&line) {
                            ctx.sink.push(event).await;
                            ctx.status.mark_event().await;
                        }
                    }
                    Ok(None) => {
                        return Err(AdapterError::Io {
                            adapter: NAME.to_owned(),
                            reason: "device closed the connection".to_owned(),
                        });
                    }
                    Err(e) => {
                        return Err(AdapterError::Io {
                            adapter: NAME.to_owned(),
                            reason: e.to_string(),
                        });
                    }
                },
                () = ctx.shutdown_requested() => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_punch_records() {
        let event =
            parse_line("{\"event\":\"punch\",\"user\":\"1042\",\"dir\":\"in\",\"ts\":1767225600}")
                .unwrap();
        assert_eq!(event.external_user_id, "1042");
        assert_eq!(event.event_type, EventType::Entry);
        assert_eq!(event.raw_data["dir"], "in");
    }

    #[test]
    fn unknown_dir_is_denied() {
        let event =
            parse_line("{\"event\":\"punch\",\"user\":\"7\",\"dir\":\"??\",\"ts\":1767225600}")
                .unwrap();
        assert_eq!(event.event_type, EventType::Denied);
    }

    #[test]
    fn chatter_is_ignored() {
        assert!(parse_line("{\"event\":\"heartbeat\",\"user\":\"\",\"dir\":\"\",\"ts\":0}").is_none());
        assert!(parse_line("not json").is_none());
        assert!(parse_line("{\"event\":\"punch\",\"user\":\"\",\"dir\":\"in\",\"ts\":1}").is_none());
    }
}
