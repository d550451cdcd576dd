//! Realtime synchronization for game catalogs
//!
//! Topics carry presence, domain events and leaderboard snapshots. The
//! [`registry`] keeps one transport link per open topic and moves links
//! between the live broker and the in-process fallback; [`presence`],
//! [`bus`] and [`leaderboard`] build typed streams on top of it, and
//! [`hub`] ties them together behind one handle.

pub mod bus;
pub mod envelope;
pub mod failover;
pub mod heartbeat;
pub mod hub;
pub mod leaderboard;
pub mod presence;
pub mod registry;
pub mod sequence;
pub mod subscription;
pub mod topic;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use bus::{BusMessage, EventBus, SequencedEvent};
pub use envelope::Envelope;
pub use failover::{ConnectionState, FailoverManager};
pub use heartbeat::{Roster, RosterChange};
pub use hub::{HubBuilder, RealtimeHub, TopicUpdate};
pub use leaderboard::{Board, BoardState, LeaderboardService};
pub use presence::{PresenceSubscription, PresenceTracker};
pub use registry::{ChannelRegistry, ChannelSignal, FailureReport, TopicStats};
pub use sequence::{GapCause, SequenceGap};
pub use subscription::Subscription;
pub use topic::{Period, Topic, TopicKind};
pub use transport::{Link, LinkSender, LocalBus, Transport, TransportKind, WsTransport};
pub use types::{
    DomainEvent, LeaderboardSnapshot, PlayerJoined, PlayerLeft, PresenceMessage, PresenceRecord, PresenceStatus,
    ScoreEntry, ScoreSubmission, ScoreSubmitted, SessionId,
};
