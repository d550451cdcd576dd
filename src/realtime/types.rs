use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::DecodeError;
use crate::realtime::topic::Period;

/// Opaque identifier of one browser/game session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Playing,
    Idle,
}

/// One session's presence within a presence topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub session_id: SessionId,
    pub display_name: String,
    pub status: PresenceStatus,
    pub joined_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn new(session_id: SessionId, display_name: impl Into<String>) -> Self {
        Self {
            session_id,
            display_name: display_name.into(),
            status: PresenceStatus::Online,
            joined_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: PresenceStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEntry {
    pub player_name: String,
    pub score: i64,
    pub submitted_at: DateTime<Utc>,
}

impl ScoreEntry {
    pub fn new(player_name: impl Into<String>, score: i64, submitted_at: DateTime<Utc>) -> Self {
        Self {
            player_name: player_name.into(),
            score,
            submitted_at,
        }
    }

    /// Leaderboard order: higher score first, earlier submission first on ties.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| self.submitted_at.cmp(&other.submitted_at))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardSnapshot {
    pub game_id: String,
    pub period: Period,
    pub entries: Vec<ScoreEntry>,
    pub as_of: DateTime<Utc>,
}

/// A score handed to the store and announced on the event bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSubmission {
    pub session_id: SessionId,
    pub display_name: String,
    pub score: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Domain events
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerJoined {
    pub session_id: SessionId,
    pub display_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerLeft {
    pub session_id: SessionId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSubmitted {
    pub session_id: SessionId,
    pub display_name: String,
    pub score: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Store-assigned submission time; receivers fall back to the envelope
    /// timestamp when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ScoreSubmitted {
    pub fn entry(&self, fallback_ts: DateTime<Utc>) -> ScoreEntry {
        ScoreEntry::new(
            self.display_name.clone(),
            self.score,
            self.submitted_at.unwrap_or(fallback_ts),
        )
    }
}

impl From<ScoreSubmission> for ScoreSubmitted {
    fn from(s: ScoreSubmission) -> Self {
        Self {
            session_id: s.session_id,
            display_name: s.display_name,
            score: s.score,
            metadata: s.metadata,
            submitted_at: None,
        }
    }
}

/// Closed set of events carried on `events:{gameId}` topics.
#[derive(Clone, Debug, PartialEq)]
pub enum DomainEvent {
    PlayerJoined(PlayerJoined),
    PlayerLeft(PlayerLeft),
    GameStarted,
    GameEnded,
    ScoreSubmitted(ScoreSubmitted),
}

impl DomainEvent {
    pub const PLAYER_JOINED: &'static str = "player_joined";
    pub const PLAYER_LEFT: &'static str = "player_left";
    pub const GAME_STARTED: &'static str = "game_started";
    pub const GAME_ENDED: &'static str = "game_ended";
    pub const SCORE_SUBMITTED: &'static str = "score_submitted";

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PlayerJoined(_) => Self::PLAYER_JOINED,
            Self::PlayerLeft(_) => Self::PLAYER_LEFT,
            Self::GameStarted => Self::GAME_STARTED,
            Self::GameEnded => Self::GAME_ENDED,
            Self::ScoreSubmitted(_) => Self::SCORE_SUBMITTED,
        }
    }

    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::PlayerJoined(p) => serde_json::to_value(p),
            Self::PlayerLeft(p) => serde_json::to_value(p),
            Self::GameStarted | Self::GameEnded => Ok(Value::Object(Map::new())),
            Self::ScoreSubmitted(p) => serde_json::to_value(p),
        }
    }

    pub fn decode(kind: &str, payload: &Value) -> Result<Self, DecodeError> {
        match kind {
            Self::PLAYER_JOINED => typed(kind, payload).map(Self::PlayerJoined),
            Self::PLAYER_LEFT => typed(kind, payload).map(Self::PlayerLeft),
            Self::GAME_STARTED => empty(kind, payload).map(|_| Self::GameStarted),
            Self::GAME_ENDED => empty(kind, payload).map(|_| Self::GameEnded),
            Self::SCORE_SUBMITTED => typed(kind, payload).map(Self::ScoreSubmitted),
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Presence messages
// ---------------------------------------------------------------------------

/// Traffic on `presence:{gameId}` topics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceMessage {
    Join(PresenceRecord),
    Heartbeat(PresenceRecord),
    Leave(SessionId),
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeavePayload {
    session_id: SessionId,
}

impl PresenceMessage {
    pub const JOIN: &'static str = "join";
    pub const HEARTBEAT: &'static str = "heartbeat";
    pub const LEAVE: &'static str = "leave";

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => Self::JOIN,
            Self::Heartbeat(_) => Self::HEARTBEAT,
            Self::Leave(_) => Self::LEAVE,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Join(r) | Self::Heartbeat(r) => &r.session_id,
            Self::Leave(id) => id,
        }
    }

    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Join(r) | Self::Heartbeat(r) => serde_json::to_value(r),
            Self::Leave(id) => serde_json::to_value(LeavePayload {
                session_id: id.clone(),
            }),
        }
    }

    pub fn decode(kind: &str, payload: &Value) -> Result<Self, DecodeError> {
        match kind {
            Self::JOIN => typed(kind, payload).map(Self::Join),
            Self::HEARTBEAT => typed(kind, payload).map(Self::Heartbeat),
            Self::LEAVE => typed::<LeavePayload>(kind, payload).map(|p| Self::Leave(p.session_id)),
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }
}

fn typed<T: serde::de::DeserializeOwned>(kind: &str, payload: &Value) -> Result<T, DecodeError> {
    T::deserialize(payload).map_err(|source| DecodeError::Payload {
        kind: kind.to_string(),
        source,
    })
}

fn empty(kind: &str, payload: &Value) -> Result<(), DecodeError> {
    match payload {
        Value::Null | Value::Object(_) => Ok(()),
        other => Err(DecodeError::Payload {
            kind: kind.to_string(),
            source: serde::de::Error::custom(format!("expected object, got {other}")),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn score_submitted_payload_is_camel_case() {
        let event = DomainEvent::ScoreSubmitted(ScoreSubmitted {
            session_id: "s1".into(),
            display_name: "P1".into(),
            score: 500,
            metadata: Map::new(),
            submitted_at: None,
        });
        let payload = event.to_payload().unwrap();
        assert_eq!(payload["sessionId"], "s1");
        assert_eq!(payload["displayName"], "P1");
        assert_eq!(DomainEvent::decode(event.kind(), &payload).unwrap(), event);
    }

    #[test]
    fn unit_events_accept_missing_payload() {
        assert_eq!(DomainEvent::decode("game_started", &Value::Null).unwrap(), DomainEvent::GameStarted);
        assert_eq!(DomainEvent::decode("game_ended", &json!({})).unwrap(), DomainEvent::GameEnded);
        assert!(DomainEvent::decode("game_ended", &json!(3)).is_err());
    }

    #[test]
    fn unknown_and_malformed_events_are_rejected() {
        assert!(matches!(
            DomainEvent::decode("level_up", &json!({})),
            Err(DecodeError::UnknownType(_))
        ));
        assert!(matches!(
            DomainEvent::decode("score_submitted", &json!({"sessionId": "s1", "score": "lots"})),
            Err(DecodeError::Payload { .. })
        ));
    }

    #[test]
    fn presence_leave_carries_only_the_session() {
        let msg = PresenceMessage::Leave("abc".into());
        let payload = msg.to_payload().unwrap();
        assert_eq!(payload, json!({"sessionId": "abc"}));
        assert_eq!(PresenceMessage::decode("leave", &payload).unwrap(), msg);
    }

    #[test]
    fn rank_order_prefers_score_then_age() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);
        let a = ScoreEntry::new("a", 100, t1);
        let b = ScoreEntry::new("b", 100, t0);
        let c = ScoreEntry::new("c", 200, t1);
        let mut v = vec![a.clone(), b.clone(), c.clone()];
        v.sort_by(ScoreEntry::rank_cmp);
        assert_eq!(v, vec![c, b, a]);
    }
}
