//! Score REST API served next to the topic sockets.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::Broker;
use crate::config::MAX_LEADERBOARD_SIZE;
use crate::errors::StoreError;
use crate::realtime::topic::{Period, Topic};
use crate::realtime::types::{ScoreEntry, ScoreSubmission, SessionId};
use crate::store::ScoreStore;

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = MAX_LEADERBOARD_SIZE;

#[derive(Debug, Deserialize)]
pub(super) struct TopQuery {
    period: Option<Period>,
    limit: Option<usize>,
}

pub(super) struct ApiError(StatusCode, String);

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Rejected(reason) => Self(StatusCode::UNPROCESSABLE_ENTITY, reason),
            other => Self(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

fn checked_game(game: &str) -> Result<(), ApiError> {
    Topic::events(game)
        .map(|_| ())
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e.to_string()))
}

pub(super) async fn top_scores(
    State(broker): State<Arc<Broker>>,
    Path(game): Path<String>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Vec<ScoreEntry>>, ApiError> {
    checked_game(&game)?;
    let period = query.period.unwrap_or(Period::AllTime);
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Ok(Json(broker.scores.get_top_scores(&game, period, limit).await?))
}

pub(super) async fn personal_best(
    State(broker): State<Arc<Broker>>,
    Path((game, session)): Path<(String, String)>,
) -> Result<Json<ScoreEntry>, ApiError> {
    checked_game(&game)?;
    match broker.scores.get_personal_best(&game, &SessionId::new(session)).await? {
        Some(best) => Ok(Json(best)),
        None => Err(ApiError(StatusCode::NOT_FOUND, "no score yet".into())),
    }
}

pub(super) async fn save_score(
    State(broker): State<Arc<Broker>>,
    Path(game): Path<String>,
    Json(submission): Json<ScoreSubmission>,
) -> Result<(StatusCode, Json<ScoreEntry>), ApiError> {
    checked_game(&game)?;
    let entry = broker.scores.save_score(&game, &submission).await?;
    log::debug!("stored {} for {} in {}", entry.score, submission.session_id, game);
    Ok((StatusCode::CREATED, Json(entry)))
}
