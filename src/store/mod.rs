//! Authoritative score storage.
//!
//! The sync layer never decides rankings on its own: leaderboards are
//! seeded and periodically corrected from a [`ScoreStore`].

use async_trait::async_trait;

use crate::errors::StoreError;
use crate::realtime::topic::Period;
use crate::realtime::types::{ScoreEntry, ScoreSubmission, SessionId};

pub mod http;
pub mod memory;

pub use http::HttpScoreStore;
pub use memory::MemoryScoreStore;

#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// Best entries of `period`, ranked, at most `limit` long.
    async fn get_top_scores(&self, game_id: &str, period: Period, limit: usize) -> Result<Vec<ScoreEntry>, StoreError>;

    async fn get_personal_best(&self, game_id: &str, session_id: &SessionId) -> Result<Option<ScoreEntry>, StoreError>;

    /// Persist a submission and return the entry as stored.
    async fn save_score(&self, game_id: &str, submission: &ScoreSubmission) -> Result<ScoreEntry, StoreError>;
}
