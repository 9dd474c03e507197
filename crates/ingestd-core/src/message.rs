//! Replication-completion event as published by Rucio.
//!
//! Only the `payload` object is used:
//!
//! ```json
//! {
//!   "event_type": "transfer-done",
//!   "payload": {
//!     "dst-rse": "XRD5",
//!     "dst-url": "root://xrd5:1098//rucio/test/ab/cd/file.fits",
//!     "rubin_butler": 2,
//!     "rubin_sidecar": "{\"id\": ...}",
//!     "scope": "test"
//!   }
//! }
//! ```

use crate::kafka::KafkaMessage;
use crate::{EntryError, KafkaError};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Sidecar metadata, either inline JSON or a string holding JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Sidecar {
    /// Inline object
    Object(serde_json::Map<String, Value>),
    /// JSON document serialized into a string
    Text(String),
}

impl Sidecar {
    /// Normalize to a JSON value.
    pub fn to_value(&self) -> Result<Value, EntryError> {
        match self {
            Sidecar::Object(map) => Ok(Value::Object(map.clone())),
            Sidecar::Text(text) => serde_json::from_str(text)
                .map_err(|e| EntryError::Metadata(format!("unparseable sidecar: {}", e))),
        }
    }
}

/// Fields of the event payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Payload {
    /// Destination RSE
    #[serde(rename = "dst-rse")]
    pub dst_rse: Option<String>,

    /// Destination URL
    #[serde(rename = "dst-url")]
    pub dst_url: Option<String>,

    /// Data kind flag
    pub rubin_butler: Option<Value>,

    /// Dataset metadata
    pub rubin_sidecar: Option<Sidecar>,

    /// Rucio scope
    pub scope: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    payload: Option<Payload>,
}

/// A parsed event.
#[derive(Debug, Clone)]
pub struct Message {
    topic: String,
    partition: i32,
    offset: i64,
    payload: Payload,
}

impl Message {
    /// Parse the value of a Kafka message.
    pub fn from_kafka(msg: &KafkaMessage) -> Result<Self, KafkaError> {
        let value = msg.value_str().ok_or_else(|| {
            KafkaError::MessageParse(format!(
                "{}[{}]@{}: empty or non-UTF-8 value",
                msg.topic, msg.partition, msg.offset
            ))
        })?;

        let envelope: Envelope = serde_json::from_str(value).map_err(|e| {
            KafkaError::MessageParse(format!(
                "{}[{}]@{}: {}",
                msg.topic, msg.partition, msg.offset, e
            ))
        })?;

        let payload = envelope.payload.ok_or_else(|| {
            KafkaError::MessageParse(format!(
                "{}[{}]@{}: no payload",
                msg.topic, msg.partition, msg.offset
            ))
        })?;

        Ok(Self {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
            payload,
        })
    }

    /// Destination RSE.
    pub fn dst_rse(&self) -> Option<&str> {
        self.payload.dst_rse.as_deref()
    }

    /// Destination URL.
    pub fn dst_url(&self) -> Option<&str> {
        self.payload.dst_url.as_deref()
    }

    /// Replace the destination URL.
    pub fn set_dst_url(&mut self, url: impl Into<String>) {
        self.payload.dst_url = Some(url.into());
    }

    /// Data kind flag.
    pub fn rubin_butler(&self) -> Option<&Value> {
        self.payload.rubin_butler.as_ref()
    }

    /// Sidecar metadata.
    pub fn rubin_sidecar(&self) -> Option<&Sidecar> {
        self.payload.rubin_sidecar.as_ref()
    }

    /// Rucio scope.
    pub fn scope(&self) -> Option<&str> {
        self.payload.scope.as_deref()
    }

    /// Topic the message came from.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]@{} {}",
            self.topic,
            self.partition,
            self.offset,
            self.dst_url().unwrap_or("<no dst-url>")
        )
    }
}
