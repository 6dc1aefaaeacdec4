//! # Redis pub/sub transport.
//!
//! Redis channels carry no headers, so every message travels in a small JSON envelope:
//!
//! ```text
//! { "reply": "<inbox>" | null, "origin": "<loopback tag>" | null, "payload": "<base64>" | null }
//! ```
//!
//! Subject patterns are translated to Redis glob patterns (`>` and `*` both become `*`).
//! Glob `*` also spans dots, so received channels are re-checked against the original
//! pattern before delivery. Pub/sub has no acknowledgement; settling is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::warn;

use crate::broker::message::ControlMessage;
use crate::broker::transport::{subject_matches, Session, Subscription, Transport};
use crate::error::BrokerError;

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Serialize, Deserialize)]
struct Envelope {
    reply: Option<String>,
    origin: Option<String>,
    payload: Option<String>,
}

fn encode(msg: &ControlMessage) -> Result<Vec<u8>, BrokerError> {
    let envelope = Envelope {
        reply: msg.reply.clone(),
        origin: msg.origin.clone(),
        payload: msg.payload.as_ref().map(|p| STANDARD.encode(p)),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

fn decode(channel: &str, raw: &[u8]) -> Result<ControlMessage, BrokerError> {
    let envelope: Envelope = serde_json::from_slice(raw)?;
    let payload = match envelope.payload {
        Some(b64) => Some(Bytes::from(
            STANDARD
                .decode(b64)
                .map_err(|e| BrokerError::Codec(e.to_string()))?,
        )),
        None => None,
    };
    Ok(ControlMessage {
        topic: channel.to_string(),
        payload,
        reply: envelope.reply,
        origin: envelope.origin,
    })
}

fn glob_pattern(pattern: &str) -> String {
    pattern
        .split('.')
        .map(|token| if token == ">" { "*" } else { token })
        .collect::<Vec<_>>()
        .join(".")
}

/// Redis pub/sub backend.
pub struct RedisTransport {
    client: redis::Client,
}

impl RedisTransport {
    /// Creates a transport for `url` (e.g. `redis://127.0.0.1:6379`). No I/O happens here.
    pub fn open(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url).map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn connect(&self) -> Result<Arc<dyn Session>, BrokerError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        Ok(Arc::new(RedisSession {
            client: self.client.clone(),
            conn,
            listeners: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct RedisSession {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
    listeners: Mutex<Vec<AbortHandle>>,
    closed: AtomicBool,
}

#[async_trait]
impl Session for RedisSession {
    async fn publish(&self, msg: ControlMessage) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let body = encode(&msg)?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(&msg.topic, body)
            .await
            .map_err(|e| BrokerError::Publish {
                topic: msg.topic.clone(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let subscribe_err = |e: redis::RedisError| BrokerError::Subscribe {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        };

        let mut pubsub = self.client.get_async_pubsub().await.map_err(subscribe_err)?;
        pubsub
            .psubscribe(glob_pattern(pattern))
            .await
            .map_err(subscribe_err)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let wanted = pattern.to_string();
        let listener = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(raw) = stream.next().await {
                let channel = raw.get_channel_name();
                if !subject_matches(&wanted, channel) {
                    continue;
                }
                match decode(channel, raw.get_payload_bytes()) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel, error = %e, "dropping undecodable message"),
                }
            }
        });
        let handle = listener.abort_handle();
        {
            let mut listeners = self.listeners.lock().await;
            listeners.retain(|l| !l.is_finished());
            listeners.push(handle.clone());
        }

        Ok(Subscription::new(pattern, rx).with_listener(handle))
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        for listener in self.listeners.lock().await.drain(..) {
            listener.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn globs_replace_tail_wildcard() {
        assert_eq!(glob_pattern("bot.>"), "bot.*");
        assert_eq!(glob_pattern("_INBOX.abc.*"), "_INBOX.abc.*");
    }

    #[test]
    fn envelope_carries_reply_and_origin() {
        let msg = ControlMessage::new("bot.eval")
            .with_payload(Some(Bytes::from_static(b"{\"id\":\"1\"}")))
            .with_reply("_INBOX.x")
            .with_origin("tag-1");
        let raw = encode(&msg).unwrap();
        let back = decode("bot.eval", &raw).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(matches!(
            decode("bot.eval", b"not json"),
            Err(BrokerError::Codec(_))
        ));
    }
}
