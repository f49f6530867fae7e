//! Item and rollup store traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{BucketKind, ScoredItem, SentimentRollup, TopicKey};

/// Error type for rollup and item store operations.
#[derive(Debug, thiserror::Error)]
pub enum RollupError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Malformed document {key}: {reason}")]
    Malformed { key: String, reason: String },

    #[error("Failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<tokio::task::JoinError> for RollupError {
    fn from(e: tokio::task::JoinError) -> Self {
        RollupError::Unavailable(format!("store task failed: {}", e))
    }
}

pub type RollupResult<T> = Result<T, RollupError>;

/// Raw scored items, immutable once written.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert items not yet present; an existing source id is left untouched.
    /// Returns how many items were newly inserted.
    async fn upsert_items(&self, items: &[ScoredItem]) -> RollupResult<usize>;

    /// Items with `start <= timestamp < end`.
    async fn items_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RollupResult<Vec<ScoredItem>>;

    async fn item_count(&self) -> RollupResult<u64>;
}

/// Snapshot and historical rollup documents.
#[async_trait]
pub trait RollupStore: Send + Sync {
    /// Replace every `current` rollup with `rollups`.
    async fn replace_current(&self, rollups: &[SentimentRollup]) -> RollupResult<()>;

    /// Insert or overwrite historical rollups by key.
    async fn upsert_rollups(&self, rollups: &[SentimentRollup]) -> RollupResult<()>;

    async fn get_current(&self, key: &TopicKey) -> RollupResult<Option<SentimentRollup>>;

    async fn get_rollup(
        &self,
        kind: BucketKind,
        start: DateTime<Utc>,
        key: &TopicKey,
    ) -> RollupResult<Option<SentimentRollup>>;

    /// Rollups of `kind` for `key` starting before `before`, newest first.
    async fn list_rollups(
        &self,
        kind: BucketKind,
        key: &TopicKey,
        before: DateTime<Utc>,
        limit: usize,
    ) -> RollupResult<Vec<SentimentRollup>>;
}
