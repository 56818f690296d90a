//! ZKTeco adapter: push-mode TCP receiver.
//!
//! The device is configured (via its own menu or vendor tooling) to push
//! realtime attendance records to the Bridge host. Frames are a 2-byte LE
//! length followed by an ASCII payload:
//!
//! ```text
//! ATTLOG:<user_id>\t<verify_mode>\t<io_mode>\t<unix_seconds>
//! ```
//!
//! `io_mode` 0 is check-in (entry), 1 is check-out (exit); anything else is
//! reported as denied. Unlock sends an `UNLOCK:<ms>` frame on the same
//! connection.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use bridge_core::event::{EventType, RawHardwareEvent};

use crate::{AdapterContext, AdapterError, AdapterInfo, Capability, HardwareAdapter};

pub const NAME: &str = "zkteco";

/// `adapter_configs.zkteco` block.
#[derive(Debug, Clone, Deserialize)]
struct ZkTecoConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
}

fn default_port() -> u16 {
    4370
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// ZKTeco push-mode driver.
#[derive(Debug, Default)]
pub struct ZkTecoAdapter {
    writer: Mutex<Option<OwnedWriteHalf>>,
}

/// Parse one `ATTLOG` payload into an event, `None` for frames we do not
/// understand (device status pings, unknown record types).
fn parse_attlog(payload: &str) -> Option<RawHardwareEvent> {
    let rest = payload.strip_prefix("ATTLOG:")?;
    let mut fields = rest.split('\t');
    let user_id = fields.next()?.trim();
    let verify_mode = fields.next()?.trim();
    let io_mode = fields.next()?.trim();
    let unix_secs: i64 = fields.next()?.trim().parse().ok()?;

    if user_id.is_empty() {
        return None;
    }
    let event_type = match io_mode {
        "0" => EventType::Entry,
        "1" => EventType::Exit,
        _ => EventType::Denied,
    };
    let timestamp = DateTime::<Utc>::from_timestamp(unix_secs, 0)?;

    let mut raw_data = serde_json::Map::new();
    raw_data.insert("verifyMode".to_owned(), serde_json::Value::from(verify_mode));
    raw_data.insert("ioMode".to_owned(), serde_json::Value::from(io_mode));
    Some(RawHardwareEvent {
        external_user_id: user_id.to_owned(),
        timestamp,
        event_type,
        raw_data,
        adapter_name: NAME.to_owned(),
    })
}

#[async_trait::async_trait]
impl HardwareAdapter for ZkTecoAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: NAME,
            capabilities: vec![Capability::EmitEvents, Capability::UnlockDoor],
        }
    }

    async fn run(&self, mut ctx: AdapterContext) -> Result<(), AdapterError> {
        let config: ZkTecoConfig =
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

        let (mut reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        ctx.status.report_running().await;
        tracing::info!(addr = %addr, "zkteco connected");

        let result = loop {
            let mut len_buf = [0u8; 2];
            tokio::select! {
                read = reader.read_exact(&mut len_buf) => {
                    if let Err(e) = read {
                        break Err(AdapterError::Io {
                            adapter: NAME.to_owned(),
                            reason: format!("frame header: {e}"),
                        });
                    }
                }
                () = ctx.shutdown_requested() => break Ok(()),
            }

            let len = usize::from(u16::from_le_bytes(len_buf));
            let mut payload = vec![0u8; len];
            tokio::select! {
                read = reader.read_exact(&mut payload) => {
                    if let Err(e) = read {
                        break Err(AdapterError::Io {
                            adapter: NAME.to_owned(),
                            reason: format!("frame body: {e}"),
                        });
                    }
                }
                () = ctx.shutdown_requested() => break Ok(()),
            }

            let text = String::from_utf8_lossy(&payload);
            match parse_attlog(&text) {
                Some(event) => {
                    ctx.sink.push(event).await;
                    ctx.status.mark_event().await;
                }
                None => {
                    tracing::debug!(frame = %text, "ignoring non-attlog frame");
                }
            }
        };

        *self.writer.lock().await = None;
        result
    }

    async fn unlock(&self, duration: Duration) -> Result<(), AdapterError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| AdapterError::Device {
            adapter: NAME.to_owned(),
            reason: "not connected".to_owned(),
        })?;

        let payload = format!("UNLOCK:{}", duration.as_millis());
        let mut frame = Vec::with_capacity(2 + payload.len());
        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(payload.as_bytes());

        writer.write_all(&frame).await.map_err(|e| {
            AdapterError::Device {
                adapter: NAME.to_owned(),
                reason: format!("unlock write: {e}"),
            }
        })?;
        tracing::info!(duration_ms = duration.as_millis() as u64, "zkteco unlock sent");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_entry_record() {
        let event = parse_attlog("ATTLOG:1042\t1\t0\t1767225600").unwrap();
        assert_eq!(event.external_user_id, "1042");
        assert_eq!(event.event_type, EventType::Entry);
        assert_eq!(event.raw_data["ioMode"], "0");
        assert_eq!(event.timestamp.timestamp(), 1_767_225_600);
    }

    #[test]
    fn io_mode_one_is_exit_and_others_are_denied() {
        assert_eq!(
            parse_attlog("ATTLOG:7\t1\t1\t1767225600").unwrap().event_type,
            EventType::Exit
        );
        assert_eq!(
            parse_attlog("ATTLOG:7\t1\t5\t1767225600").unwrap().event_type,
            EventType::Denied
        );
    }

    #[test]
    fn malformed_frames_are_ignored() {
        assert!(parse_attlog("OPLOG:reboot").is_none());
        assert!(parse_attlog("ATTLOG:\t1\t0\t1767225600").is_none());
        assert!(parse_attlog("ATTLOG:7\t1\t0\tnot-a-number").is_none());
        assert!(parse_attlog("ATTLOG:7\t1").is_none());
    }

    #[tokio::test]
    async fn unlock_without_connection_is_a_device_error() {
        let adapter = ZkTecoAdapter::default();
        assert!(matches!(
            adapter.unlock(Duration::from_millis(3_000)).await,
            Err(AdapterError::Device { .. })
        ));
    }

    #[tokio::test]
    async fn missing_host_is_a_config_error() {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let adapter = ZkTecoAdapter::default();
        let ctx = AdapterContext {
            config: serde_json::json!({}),
            sink: std::sync::Arc::new(NullSink) as std::sync::Arc<dyn crate::EventSink>,
            status: crate::StatusHandle::new(NAME),
            shutdown: rx,
        };
        assert!(matches!(
            adapter.run(ctx).await,
            Err(AdapterError::Config { .. })
        ));
    }

    struct NullSink;

    #[async_trait::async_trait]
    impl crate::EventSink for NullSink {
        async fn push(&self, _event: RawHardwareEvent) {}
    }
}
