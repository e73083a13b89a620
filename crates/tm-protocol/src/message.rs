//! Message type carried by every frame

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Cow;

use crate::error::ProtocolError;
use crate::topic::Topic;

/// A topic-addressed payload
///
/// The payload is opaque to the transport; in practice it is UTF-8 JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Where the message is addressed
    pub topic: Topic,
    /// Payload bytes, without the wire terminator
    pub payload: Bytes,
}

impl Message {
    /// Create a new message
    pub fn new(topic: Topic, payload: impl Into<Bytes>) -> Self {
        Self {
            topic,
            payload: payload.into(),
        }
    }

    /// Serialize `value` as the JSON payload of a new message
    pub fn json<T: Serialize>(topic: Topic, value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(topic, payload))
    }

    /// Payload as text, replacing invalid UTF-8 sequences
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Deserialize the JSON payload
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}
