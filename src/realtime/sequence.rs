use serde::Serialize;

use crate::realtime::topic::Topic;
use crate::realtime::transport::TransportKind;

/// Why a subscriber may have missed messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum GapCause {
    /// Sequence numbers skipped ahead.
    Missed { expected: u64, received: u64 },
    /// The topic moved to another transport; numbering restarted.
    TransportSwitched { to: TransportKind },
}

/// Signal that the subscriber should reconcile from an authoritative source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SequenceGap {
    pub topic: Topic,
    #[serde(flatten)]
    pub cause: GapCause,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqCheck {
    First,
    InOrder,
    Gap { expected: u64, received: u64 },
    Duplicate,
}

/// Per-subscription view of a topic's sequence numbers.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    pub fn observe(&mut self, seq: u64) -> SeqCheck {
        let Some(last) = self.last else {
            self.last = Some(seq);
            return SeqCheck::First;
        };
        if seq <= last {
            return SeqCheck::Duplicate;
        }
        self.last = Some(seq);
        if seq - last > 1 {
            SeqCheck::Gap {
                expected: last + 1,
                received: seq,
            }
        } else {
            SeqCheck::InOrder
        }
    }

    /// Forget history; the next frame is treated as the first.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
