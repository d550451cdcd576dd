use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::StatusCode;

use super::ScoreStore;
use crate::config::StoreConfig;
use crate::errors::StoreError;
use crate::realtime::topic::Period;
use crate::realtime::types::{ScoreEntry, ScoreSubmission, SessionId};

/// REST client for a score store (the broker serves a compatible API).
///
/// ```text
/// GET  {base}/games/{game}/scores?period=daily&limit=10   -> [ScoreEntry]
/// GET  {base}/games/{game}/players/{session}/best         -> ScoreEntry | 404
/// POST {base}/games/{game}/scores   body: ScoreSubmission -> ScoreEntry
/// ```
pub struct HttpScoreStore {
    base_url: String,
    http: reqwest::Client,
}

impl HttpScoreStore {
    pub fn new(base_url: &str, config: &StoreConfig) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn game_url(&self, game_id: &str) -> String {
        format!("{}/games/{}", self.base_url, utf8_percent_encode(game_id, NON_ALPHANUMERIC))
    }
}

fn classify(error: reqwest::Error) -> StoreError {
    if error.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Http(error)
    }
}

#[async_trait]
impl ScoreStore for HttpScoreStore {
    async fn get_top_scores(&self, game_id: &str, period: Period, limit: usize) -> Result<Vec<ScoreEntry>, StoreError> {
        let url = format!("{}/scores", self.game_url(game_id));
        let response = self
            .http
            .get(&url)
            .query(&[("period", period.as_str().to_string()), ("limit", limit.to_string())])
            .send()
            .await
            .map_err(classify)?;
        if !response.status().is_success() {
            return Err(StoreError::Status(response.status().as_u16()));
        }
        response.json().await.map_err(classify)
    }

    async fn get_personal_best(&self, game_id: &str, session_id: &SessionId) -> Result<Option<ScoreEntry>, StoreError> {
        let url = format!(
            "{}/players/{}/best",
            self.game_url(game_id),
            utf8_percent_encode(session_id.as_str(), NON_ALPHANUMERIC)
        );
        let response = self.http.get(&url).send().await.map_err(classify)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await.map_err(classify)?)),
            status => Err(StoreError::Status(status.as_u16())),
        }
    }

    async fn save_score(&self, game_id: &str, submission: &ScoreSubmission) -> Result<ScoreEntry, StoreError> {
        let url = format!("{}/scores", self.game_url(game_id));
        let response = self
            .http
            .post(&url)
            .json(submission)
            .send()
            .await
            .map_err(classify)?;
        match response.status() {
            StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
                let reason = response.text().await.unwrap_or_default();
                Err(StoreError::Rejected(reason))
            }
            status if status.is_success() => response.json().await.map_err(classify),
            status => Err(StoreError::Status(status.as_u16())),
        }
    }
}
