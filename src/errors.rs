use thiserror::Error;

use crate::realtime::topic::TopicKind;

/// Errors raised by a transport link.
///
/// These never reach subscribers: the registry turns them into failure
/// reports for the failover manager.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no live backend configured")]
    NotConfigured,
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("link for topic '{0}' is closed")]
    Closed(String),
    #[error("publish on '{0}' was not acknowledged in time")]
    AckTimeout(String),
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors returned by a score store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("score store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("score store returned status {0}")]
    Status(u16),
    #[error("score store call timed out")]
    Timeout,
    #[error("score rejected: {0}")]
    Rejected(String),
}

/// An envelope that does not map onto a known message type.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("malformed '{kind}' payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Public error type of the sync layer.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),
    #[error("topic '{topic}' is a {actual} topic, expected {expected}")]
    TopicKind {
        topic: String,
        expected: TopicKind,
        actual: TopicKind,
    },
    #[error("session '{session}' already joined {topic}")]
    AlreadyJoined { topic: String, session: String },
    #[error("topic '{0}' is unavailable")]
    Unavailable(String),
    #[error("hub has been shut down")]
    ShutDown,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
