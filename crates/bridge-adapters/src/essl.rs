//! ESSL adapter: line-oriented TCP receiver.
//!
//! ESSL attendance controllers push newline-terminated CSV records:
//!
//! ```text
//! LOG,<user_id>,<direction>,<unix_seconds>
//! ```
//!
//! where `direction` is `IN`, `OUT`, or `DENY`. Other lines (keepalives,
//! status) are ignored.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

use bridge_core::event::{EventType, RawHardwareEvent};

use crate::{AdapterContext, AdapterError, AdapterInfo, Capability, HardwareAdapter};

pub const NAME: &str = "essl";

/// `adapter_configs.essl` block.
#[derive(Debug, Clone, Deserialize)]
struct EsslConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
}

fn default_port() -> u16 {
    5005
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// ESSL push-mode driver.
#[derive(Debug, Default)]
pub struct EsslAdapter;

/// Parse one CSV line, `None` for anything that is not an access record.
fn parse_line(line: &str) -> Option<RawHardwareEvent> {
    let mut fields = line.trim().split(',');
    if fields.next()? != "LOG" {
        return None;
    }
    let user_id = fields.next()?.trim();
    let direction = fields.next()?.trim();
    let unix_secs: i64 = fields.next()?.trim().parse().ok()?;
    if user_id.is_empty() {
        return None;
    }

    let event_type = match direction {
        "IN" => EventType::Entry,
        "OUT" => EventType::Exit,
        _ => EventType::Denied,
    };
    let timestamp = DateTime::<Utc>::from_timestamp(unix_secs, 0)?;

    let mut raw_data = serde_json::Map::new();
    raw_data.insert("direction".to_owned(), serde_json::Value::from(direction));
    Some(RawHardwareEvent {
        external_user_id: user_id.to_owned(),
        timestamp,
        event_type,
        raw_data,
        adapter_name: NAME.to_owned(),
    })
}

#[async_trait::async_trait]
impl HardwareAdapter for EsslAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: NAME,
            capabilities: vec![Capability::EmitEvents],
        }
    }

    async fn run(&self, mut ctx: AdapterContext) -> Result<(), AdapterError> {
        let config: EsslConfig =
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
        tracing::info!(addr = %addr, "essl connected");

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
