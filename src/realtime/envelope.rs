use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::DecodeError;
use crate::realtime::topic::Topic;
use crate::realtime::types::{DomainEvent, PresenceMessage};

/// Wire frame shared by every topic.
///
/// ```text
/// { "topic": "events:snake", "seq": 7, "type": "score_submitted",
///   "payload": { ... }, "ts": "2026-02-23T14:30:00.000Z" }
/// ```
///
/// `seq` is zero until the publishing side of the transport stamps it.
/// `ref` correlates a publish with its acknowledgement and is only ever
/// echoed back to the link that sent it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    #[serde(default)]
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(with = "crate::utils::time_utils::iso")]
    pub ts: DateTime<Utc>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<u64>,
}

impl Envelope {
    pub fn new(topic: Topic, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            topic,
            seq: 0,
            kind: kind.into(),
            payload,
            ts: Utc::now(),
            reference: None,
        }
    }

    pub fn event(topic: Topic, event: &DomainEvent) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic, event.kind(), event.to_payload()?))
    }

    pub fn presence(topic: Topic, message: &PresenceMessage) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic, message.kind(), message.to_payload()?))
    }

    pub fn decode_event(&self) -> Result<DomainEvent, DecodeError> {
        DomainEvent::decode(&self.kind, &self.payload)
    }

    pub fn decode_presence(&self) -> Result<PresenceMessage, DecodeError> {
        PresenceMessage::decode(&self.kind, &self.payload)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(raw)?)
    }
}
