//! Control-plane message model.

use bytes::Bytes;
use serde::Serialize;

use crate::error::BrokerError;

/// One message on the control plane.
///
/// Produced by a transport on receive, constructed locally on publish. `origin` carries
/// the sender's loopback tag so that a connection can recognize its own traffic on a
/// shared channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControlMessage {
    /// Subject / channel the message was published on.
    pub topic: String,
    /// Raw payload (JSON on the wire), or none.
    pub payload: Option<Bytes>,
    /// Where replies should go.
    pub reply: Option<String>,
    /// Loopback tag of the sending connection.
    pub origin: Option<String>,
}

impl ControlMessage {
    /// Creates a payload-less message on `topic`.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    /// Serializes `value` as the JSON payload.
    pub fn with_json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, BrokerError> {
        self.payload = Some(Bytes::from(serde_json::to_vec(value)?));
        Ok(self)
    }

    pub fn with_payload(mut self, payload: Option<Bytes>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Decodes the payload as JSON, treating a missing payload as JSON `null`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, BrokerError> {
        match &self.payload {
            Some(bytes) => Ok(serde_json::from_slice(bytes)?),
            None => Ok(serde_json::from_value(serde_json::Value::Null)?),
        }
    }
}

/// How a received message is settled with the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settle {
    /// Consumed by this connection.
    Ack,
    /// Not meant for this connection; hand it back for another consumer.
    Requeue,
}
