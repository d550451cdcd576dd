//! Realtime presence, live score events and leaderboards for casual game
//! catalogs.
//!
//! A [`RealtimeHub`] connects to an `arcade-broker` over WebSockets when a
//! backend is configured and falls back to an in-process bus when it is
//! not, or when the broker becomes unreachable. Subscribers see the same
//! API either way.

pub mod broker;
pub mod config;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod realtime;
pub mod store;
pub mod utils;

pub use config::{BackoffConfig, BrokerConfig, HeartbeatConfig, LeaderboardConfig, StoreConfig, SyncConfig, TransportConfig};
pub use errors::{ConfigError, DecodeError, Result, StoreError, SyncError, TransportError};
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use realtime::{
    BusMessage, ConnectionState, DomainEvent, GapCause, LeaderboardSnapshot, Period, PresenceRecord, PresenceStatus,
    PresenceSubscription, RealtimeHub, ScoreEntry, ScoreSubmission, SequenceGap, SequencedEvent, SessionId,
    Subscription, Topic, TopicUpdate, TransportKind,
};
pub use store::{HttpScoreStore, MemoryScoreStore, ScoreStore};
