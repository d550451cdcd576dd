use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::SyncError;

/// Leaderboard aggregation window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Daily,
    Weekly,
    Monthly,
    AllTime,
}

impl Period {
    pub const ALL: [Period; 4] = [Period::Daily, Period::Weekly, Period::Monthly, Period::AllTime];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::AllTime => "all_time",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "all_time" => Ok(Self::AllTime),
            other => Err(SyncError::InvalidTopic(format!("unknown period '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Presence,
    Events,
    Leaderboard,
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Presence => "presence",
            Self::Events => "events",
            Self::Leaderboard => "leaderboard",
        })
    }
}

/// Named scope of a pub/sub stream.
///
/// Wire form: `presence:{gameId}`, `events:{gameId}` or
/// `leaderboard:{gameId}:{period}`. Game ids are non-empty and never
/// contain `:`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Presence(String),
    Events(String),
    Leaderboard(String, Period),
}

impl Topic {
    pub fn presence(game_id: impl Into<String>) -> Result<Self, SyncError> {
        Ok(Self::Presence(checked_game_id(game_id.into())?))
    }

    pub fn events(game_id: impl Into<String>) -> Result<Self, SyncError> {
        Ok(Self::Events(checked_game_id(game_id.into())?))
    }

    pub fn leaderboard(game_id: impl Into<String>, period: Period) -> Result<Self, SyncError> {
        Ok(Self::Leaderboard(checked_game_id(game_id.into())?, period))
    }

    pub fn kind(&self) -> TopicKind {
        match self {
            Self::Presence(_) => TopicKind::Presence,
            Self::Events(_) => TopicKind::Events,
            Self::Leaderboard(..) => TopicKind::Leaderboard,
        }
    }

    pub fn game_id(&self) -> &str {
        match self {
            Self::Presence(g) | Self::Events(g) | Self::Leaderboard(g, _) => g,
        }
    }

    pub(crate) fn expect_kind(&self, expected: TopicKind) -> Result<(), SyncError> {
        if self.kind() == expected {
            Ok(())
        } else {
            Err(SyncError::TopicKind {
                topic: self.to_string(),
                expected,
                actual: self.kind(),
            })
        }
    }
}

fn checked_game_id(game_id: String) -> Result<String, SyncError> {
    if game_id.is_empty() || game_id.contains(':') || game_id.chars().any(char::is_whitespace) {
        return Err(SyncError::InvalidTopic(format!("bad game id '{game_id}'")));
    }
    Ok(game_id)
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Presence(g) => write!(f, "presence:{g}"),
            Self::Events(g) => write!(f, "events:{g}"),
            Self::Leaderboard(g, p) => write!(f, "leaderboard:{g}:{p}"),
        }
    }
}

impl FromStr for Topic {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            ["presence", game] => Self::presence(*game),
            ["events", game] => Self::events(*game),
            ["leaderboard", game, period] => Self::leaderboard(*game, period.parse()?),
            _ => Err(SyncError::InvalidTopic(s.to_string())),
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
