use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::realtime::types::{PresenceMessage, PresenceRecord, SessionId};

/// Effect of one presence message on a roster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RosterChange {
    Unchanged,
    Joined,
    Updated,
    Left,
}

impl RosterChange {
    pub fn is_visible(self) -> bool {
        self != Self::Unchanged
    }
}

struct Member {
    record: PresenceRecord,
    /// Sender timestamp of the newest message applied for this session
    updated: DateTime<Utc>,
    /// Local arrival of the newest heartbeat, for expiry
    last_seen: Instant,
}

/// Heartbeat-driven membership table for one presence topic.
///
/// Messages are applied latest-timestamp-wins per session, so a join or
/// heartbeat that was overtaken by a leave cannot resurrect the session.
/// Sessions whose heartbeats stop are dropped by [`Roster::expire`].
#[derive(Default)]
pub struct Roster {
    members: HashMap<SessionId, Member>,
    departed: HashMap<SessionId, DateTime<Utc>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, message: &PresenceMessage, ts: DateTime<Utc>, now: Instant) -> RosterChange {
        match message {
            PresenceMessage::Join(record) | PresenceMessage::Heartbeat(record) => self.upsert(record, ts, now),
            PresenceMessage::Leave(session_id) => self.leave(session_id, ts),
        }
    }

    fn upsert(&mut self, record: &PresenceRecord, ts: DateTime<Utc>, now: Instant) -> RosterChange {
        if self.departed.get(&record.session_id).is_some_and(|left| *left >= ts) {
            return RosterChange::Unchanged;
        }
        if let Some(member) = self.members.get_mut(&record.session_id) {
            if ts < member.updated {
                return RosterChange::Unchanged;
            }
            member.updated = ts;
            member.last_seen = now;
            if member.record == *record {
                return RosterChange::Unchanged;
            }
            member.record = record.clone();
            return RosterChange::Updated;
        }
        self.departed.remove(&record.session_id);
        self.members.insert(
            record.session_id.clone(),
            Member {
                record: record.clone(),
                updated: ts,
                last_seen: now,
            },
        );
        RosterChange::Joined
    }

    fn leave(&mut self, session_id: &SessionId, ts: DateTime<Utc>) -> RosterChange {
        if self.members.get(session_id).is_some_and(|m| m.updated > ts) {
            return RosterChange::Unchanged;
        }
        let tombstone = self.departed.entry(session_id.clone()).or_insert(ts);
        if *tombstone < ts {
            *tombstone = ts;
        }
        if self.members.remove(session_id).is_some() {
            RosterChange::Left
        } else {
            RosterChange::Unchanged
        }
    }

    /// Refresh liveness without a message (local sessions).
    pub fn touch(&mut self, session_id: &SessionId, now: Instant) -> bool {
        match self.members.get_mut(session_id) {
            Some(member) => {
                member.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Remove sessions not heard from for longer than `window`.
    pub fn expire(&mut self, now: Instant, window: Duration) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .members
            .iter()
            .filter(|(_, m)| now.saturating_duration_since(m.last_seen) > window)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.members.remove(id);
        }
        expired
    }

    /// Forget leave markers older than `cutoff`.
    pub fn prune_departed(&mut self, cutoff: DateTime<Utc>) {
        self.departed.retain(|_, left| *left >= cutoff);
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.members.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Full membership ordered by join time, then session id.
    pub fn snapshot(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self.members.values().map(|m| m.record.clone()).collect();
        records.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        records
    }
}
