//! Notification stream producer.
//!
//! Connects to the gateway websocket, keeps the connection alive with pings,
//! and turns `trigger` notifications into command sessions for the worker
//! pool. Payloads are JSON when they look like it and BSON otherwise; a
//! dropped connection reconnects with linear backoff.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::command::Commands;
use crate::config::OperatorConfig;
use crate::error::{OperatorError, Result};
use crate::pool::WorkerPool;
use crate::session::{self, CHANNEL_NOTIFICATIONS};

const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Notification destinations this operator consumes.
const DEST_TRIGGER: &str = "trigger";

/// Envelope received on the notification stream.
#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub target: BTreeMap<String, String>,
    #[serde(default)]
    pub notification: serde_json::Value,
}

/// Consumes the gateway notification stream for the lifetime of the process.
pub struct NotificationHandler {
    config: Arc<OperatorConfig>,
    http: reqwest::Client,
    pool: Arc<WorkerPool>,
}

impl NotificationHandler {
    pub fn new(
        config: Arc<OperatorConfig>,
        http: reqwest::Client,
        pool: Arc<WorkerPool>,
    ) -> Self {
        NotificationHandler { config, http, pool }
    }

    /// Runs the connect/consume loop. Returns immediately when no gateway is
    /// configured.
    pub async fn run(&self) {
        let Some(url) = websocket_url(&self.config) else {
            info!("no notification gateway configured, stream producer disabled");
            return;
        };

        let mut retries: u32 = 0;
        loop {
            match self.consume_stream(&url).await {
                Ok(()) => {
                    retries = 0;
                }
                Err(e) => {
                    retries += 1;
                    let backoff = Duration::from_secs(2 * u64::from(retries));
                    warn!(error = %e, retry = retries, "notification stream dropped, reconnecting");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// One websocket session: ping on an interval, decode and route incoming
    /// frames, bail out on close.
    async fn consume_stream(&self, url: &str) -> Result<()> {
        let (mut stream, _) = connect_async(url)
            .await
            .map_err(|e| OperatorError::Http(format!("websocket connect failed: {}", e)))?;
        info!("waiting for notifications");

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    stream
                        .send(Message::Ping(Vec::new().into()))
                        .await
                        .map_err(|e| OperatorError::Http(format!("ping failed: {}", e)))?;
                }
                frame = stream.next() => {
                    let Some(frame) = frame else {
                        return Err(OperatorError::Http("websocket stream ended".to_string()));
                    };
                    let frame = frame
                        .map_err(|e| OperatorError::Http(format!("websocket receive failed: {}", e)))?;
                    match frame {
                        Message::Text(text) => self.handle_payload(text.as_bytes()),
                        Message::Binary(bytes) => self.handle_payload(&bytes),
                        Message::Close(frame) => {
                            return Err(OperatorError::Http(format!(
                                "websocket closed by server: {:?}",
                                frame
                            )));
                        }
                        // Pongs and pings need no action.
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_payload(&self, bytes: &[u8]) {
        let notification = match decode_notification(bytes) {
            Ok(notification) => notification,
            Err(e) => {
                error!(error = %e, "failed to decode notification");
                return;
            }
        };

        match notification.target.get("dest").map(String::as_str) {
            Some(DEST_TRIGGER) => {}
            other => {
                warn!(dest = ?other, "notification for another destination, ignoring");
                return;
            }
        }

        let commands = match commands_from_notification(&notification) {
            Ok(commands) => commands,
            Err(e) => {
                error!(error = %e, "failed to parse notification commands");
                return;
            }
        };

        for command in commands.commands {
            let session = session::new_session(
                &self.config,
                self.http.clone(),
                command.clone(),
                CHANNEL_NOTIFICATIONS,
                &command.job_tracking.parent_id,
                &command.job_tracking.job_id,
                1,
            );
            self.pool.invoke_or_log(session);
        }
    }
}

/// Decodes a notification frame: JSON first when the payload looks like it,
/// BSON as the fallback either way.
pub fn decode_notification(bytes: &[u8]) -> Result<Notification> {
    if bytes.is_empty() {
        return Err(OperatorError::Serialization(
            "empty notification frame".to_string(),
        ));
    }
    match bytes[0] {
        b'{' | b'[' | b'"' => serde_json::from_slice(bytes).or_else(|json_err| {
            bson::from_slice(bytes).map_err(|_| {
                OperatorError::Serialization(format!("not JSON ({}) nor BSON", json_err))
            })
        }),
        _ => bson::from_slice(bytes)
            .map_err(|e| OperatorError::Serialization(format!("BSON decode failed: {}", e))),
    }
}

/// Extracts the command batch out of a notification payload.
pub fn commands_from_notification(notification: &Notification) -> Result<Commands> {
    Ok(serde_json::from_value(notification.notification.clone())?)
}

/// Gateway URL with the identifying query parameters, or `None` when the
/// gateway is not configured.
pub fn websocket_url(config: &OperatorConfig) -> Option<String> {
    let host = config.gateway_websocket_url.as_str();
    if host.is_empty() {
        return None;
    }

    let (scheme, host) = if let Some(rest) = host.strip_prefix("wss://") {
        ("wss", rest)
    } else if let Some(rest) = host.strip_prefix("ws://") {
        ("ws", rest)
    } else {
        ("ws", host)
    };

    Some(format!(
        "{}://{}/v1/waitfornotification?customerGUID={}&cluster={}&component=operator",
        scheme,
        host.trim_end_matches('/'),
        config.account_id,
        config.cluster_name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;

    #[test]
    fn test_decode_json_notification() {
        let payload = serde_json::json!({
            "target": {"dest": "trigger"},
            "notification": {
                "commands": [{"commandName": "scanImages", "wlid": "wlid://cluster-c/namespace-n/deployment-d"}]
            }
        });
        let notification = decode_notification(payload.to_string().as_bytes()).unwrap();
        assert_eq!(
            notification.target.get("dest").map(String::as_str),
            Some("trigger")
        );

        let commands = commands_from_notification(&notification).unwrap();
        assert_eq!(commands.commands.len(), 1);
        assert_eq!(commands.commands[0].command_name, CommandKind::ScanImages);
    }

    #[test]
    fn test_decode_bson_notification() {
        let doc = bson::doc! {
            "target": {"dest": "trigger"},
            "notification": {"commands": []}
        };
        let bytes = bson::to_vec(&doc).unwrap();
        // BSON documents start with a length byte, not '{'.
        assert!(!matches!(bytes[0], b'{' | b'[' | b'"'));

        let notification = decode_notification(&bytes).unwrap();
        assert_eq!(
            notification.target.get("dest").map(String::as_str),
            Some("trigger")
        );
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_notification(b"").is_err());
        assert!(decode_notification(b"\x02\x00garbage").is_err());
        assert!(decode_notification(b"{not json").is_err());
    }

    #[test]
    fn test_websocket_url_schemes() {
        let mut config = OperatorConfig {
            account_id: "acc".to_string(),
            cluster_name: "prod".to_string(),
            gateway_websocket_url: "gateway.example.com".to_string(),
            ..OperatorConfig::default()
        };
        assert_eq!(
            websocket_url(&config).unwrap(),
            "ws://gateway.example.com/v1/waitfornotification?customerGUID=acc&cluster=prod&component=operator"
        );

        config.gateway_websocket_url = "wss://gateway.example.com".to_string();
        assert!(websocket_url(&config).unwrap().starts_with("wss://"));

        config.gateway_websocket_url = String::new();
        assert!(websocket_url(&config).is_none());
    }
}
