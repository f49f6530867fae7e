//! Shard store trait and error types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{AnnotationRun, RunStatus, ShardStatus, ShardTask};

/// Error type for shard store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already exists: {0}")]
    RunExists(String),

    #[error("Shard not found: {run_id}/{shard_id}")]
    ShardNotFound { run_id: String, shard_id: String },

    #[error("Malformed document {key}: {reason}")]
    Malformed { key: String, reason: String },
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Unavailable(format!("store task failed: {}", e))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Malformed {
            key: "run config".to_string(),
            reason: e.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Expected state of a shard document for a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    /// Document version equals this value.
    Version(u64),
    /// Unclaimed, or claimed with a lease that expired before this instant.
    Claimable(DateTime<Utc>),
    /// Owner field equals this worker.
    OwnedBy(String),
    /// Status equals this value.
    Status(ShardStatus),
}

impl Precondition {
    pub fn holds(&self, task: &ShardTask) -> bool {
        match self {
            Precondition::Version(v) => task.version == *v,
            Precondition::Claimable(now) => task.is_claimable(*now),
            Precondition::OwnedBy(worker) => task.is_owned_by(worker),
            Precondition::Status(status) => task.status == *status,
        }
    }

    pub fn all_hold(expected: &[Precondition], task: &ShardTask) -> bool {
        expected.iter().all(|p| p.holds(task))
    }
}

/// Document store for annotation runs and their shards.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Write a run document and all of its shards. Fails if the run exists.
    async fn create_run(&self, run: &AnnotationRun, shards: &[ShardTask]) -> StoreResult<()>;

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<AnnotationRun>>;

    /// Move a run from `expected` to `status`. Returns false, without
    /// writing, if the run is no longer in `expected`.
    async fn set_run_status(
        &self,
        run_id: &str,
        expected: RunStatus,
        status: RunStatus,
    ) -> StoreResult<bool>;

    async fn get_shard(&self, run_id: &str, shard_id: &str) -> StoreResult<Option<ShardTask>>;

    /// List shards, optionally filtered by status, ordered by shard id.
    async fn list_shards(
        &self,
        run_id: &str,
        status: Option<ShardStatus>,
    ) -> StoreResult<Vec<ShardTask>>;

    /// Up to `limit` shards matching "unclaimed OR lease expired at `now`".
    ///
    /// Unclaimed shards come first in shard id order, then expired claims
    /// oldest lease first.
    async fn list_claimable(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ShardTask>>;

    /// Replace the shard document with `next` if every precondition holds
    /// against the stored state.
    ///
    /// The store assigns `version = stored.version + 1`. Returns the stored
    /// document on success, `None` if a precondition failed.
    async fn update_if(
        &self,
        expected: &[Precondition],
        next: &ShardTask,
    ) -> StoreResult<Option<ShardTask>>;
}
