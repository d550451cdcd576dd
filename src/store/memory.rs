use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::ScoreStore;
use crate::errors::StoreError;
use crate::realtime::topic::Period;
use crate::realtime::types::{ScoreEntry, ScoreSubmission, SessionId};
use crate::utils::time_utils::in_period;

#[derive(Clone, Debug)]
struct StoredScore {
    session_id: SessionId,
    entry: ScoreEntry,
    metadata: Map<String, Value>,
}

/// Process-local score store.
///
/// Backs the broker's REST API and hubs started without a store URL.
#[derive(Default)]
pub struct MemoryScoreStore {
    games: RwLock<HashMap<String, Vec<StoredScore>>>,
}

impl MemoryScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a score with an explicit submission time.
    pub fn insert(&self, game_id: &str, session_id: SessionId, entry: ScoreEntry) {
        self.games
            .write()
            .entry(game_id.to_string())
            .or_default()
            .push(StoredScore {
                session_id,
                entry,
                metadata: Map::new(),
            });
    }

    /// Metadata of the session's most recent submission.
    pub fn latest_metadata(&self, game_id: &str, session_id: &SessionId) -> Option<Map<String, Value>> {
        let games = self.games.read();
        games
            .get(game_id)?
            .iter()
            .rev()
            .find(|s| &s.session_id == session_id)
            .map(|s| s.metadata.clone())
    }

    pub fn score_count(&self, game_id: &str) -> usize {
        self.games.read().get(game_id).map_or(0, Vec::len)
    }

    fn top_at(&self, game_id: &str, period: Period, limit: usize, now: DateTime<Utc>) -> Vec<ScoreEntry> {
        let games = self.games.read();
        let mut entries: Vec<ScoreEntry> = games
            .get(game_id)
            .map(|scores| {
                scores
                    .iter()
                    .filter(|s| in_period(period, s.entry.submitted_at, now))
                    .map(|s| s.entry.clone())
                    .collect()
            })
            .unwrap_or_default();
        // Stable sort keeps insertion order on full ties
        entries.sort_by(ScoreEntry::rank_cmp);
        entries.truncate(limit);
        entries
    }
}

#[async_trait]
impl ScoreStore for MemoryScoreStore {
    async fn get_top_scores(&self, game_id: &str, period: Period, limit: usize) -> Result<Vec<ScoreEntry>, StoreError> {
        Ok(self.top_at(game_id, period, limit, Utc::now()))
    }

    async fn get_personal_best(&self, game_id: &str, session_id: &SessionId) -> Result<Option<ScoreEntry>, StoreError> {
        let games = self.games.read();
        Ok(games.get(game_id).and_then(|scores| {
            scores
                .iter()
                .filter(|s| &s.session_id == session_id)
                .map(|s| &s.entry)
                .min_by(|a, b| a.rank_cmp(b))
                .cloned()
        }))
    }

    async fn save_score(&self, game_id: &str, submission: &ScoreSubmission) -> Result<ScoreEntry, StoreError> {
        if submission.display_name.trim().is_empty() {
            return Err(StoreError::Rejected("display name is empty".into()));
        }
        if submission.score < 0 {
            return Err(StoreError::Rejected(format!("negative score {}", submission.score)));
        }
        let entry = ScoreEntry::new(submission.display_name.clone(), submission.score, Utc::now());
        self.games
            .write()
            .entry(game_id.to_string())
            .or_default()
            .push(StoredScore {
                session_id: submission.session_id.clone(),
                entry: entry.clone(),
                metadata: submission.metadata.clone(),
            });
        Ok(entry)
    }
}
