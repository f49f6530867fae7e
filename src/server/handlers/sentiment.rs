//! Read-only sentiment endpoints.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::super::AppState;
use crate::models::{BucketKind, SentimentRollup, TopicKey};

/// Query parameters shared by every sentiment endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct SentimentParams {
    pub subreddit: Option<String>,
    pub topic: Option<String>,
    /// Number of buckets to return, newest first. Ignored for `current`.
    pub history: Option<usize>,
}

impl SentimentParams {
    fn key(&self) -> TopicKey {
        let pick = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(TopicKey::ALL)
                .to_string()
        };
        TopicKey::new(&pick(&self.subreddit), &pick(&self.topic))
    }
}

#[derive(Debug, Serialize)]
pub struct SentimentResponse {
    pub window: &'static str,
    pub subreddit: String,
    pub topic: String,
    pub rollups: Vec<SentimentRollup>,
}

async fn sentiment(state: AppState, kind: BucketKind, params: SentimentParams) -> Response {
    let key = params.key();
    match state
        .pipeline
        .view(kind, &key, params.history.unwrap_or(1))
        .await
    {
        Ok(rollups) => Json(SentimentResponse {
            window: kind.as_str(),
            subreddit: key.subreddit,
            topic: key.topic,
            rollups,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(window = kind.as_str(), key = %key, "Rollup query failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "service unavailable" })),
            )
                .into_response()
        }
    }
}

/// Trailing-window snapshot.
pub async fn sentiment_current(
    State(state): State<AppState>,
    Query(params): Query<SentimentParams>,
) -> Response {
    sentiment(state, BucketKind::Current, params).await
}

pub async fn sentiment_day(
    State(state): State<AppState>,
    Query(params): Query<SentimentParams>,
) -> Response {
    sentiment(state, BucketKind::Day, params).await
}

pub async fn sentiment_week(
    State(state): State<AppState>,
    Query(params): Query<SentimentParams>,
) -> Response {
    sentiment(state, BucketKind::Week, params).await
}

pub async fn sentiment_month(
    State(state): State<AppState>,
    Query(params): Query<SentimentParams>,
) -> Response {
    sentiment(state, BucketKind::Month, params).await
}
