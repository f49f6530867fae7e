//! Write-once blob storage for shard outputs.
//!
//! Objects are keyed by run, shard, attempt and kind, so a stale worker's
//! output never lands on the same path as the attempt that completed.

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::InMemoryBlobStore;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// Kind used for scored-item payloads.
pub const SCORED_KIND: &str = "scored";

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid blob key: {0}")]
    InvalidKey(String),

    #[error("Blob IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blob task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Address of one shard attempt's output.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobKey {
    pub run_id: String,
    pub shard_id: String,
    pub attempt: u32,
    pub kind: String,
}

impl BlobKey {
    pub fn new(run_id: &str, shard_id: &str, attempt: u32, kind: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            shard_id: shard_id.to_string(),
            attempt,
            kind: kind.to_string(),
        }
    }

    /// `{run}/{shard}/attempt-0001/{kind}.jsonl`
    pub fn path(&self) -> String {
        format!(
            "{}/{}/attempt-{:04}/{}.jsonl",
            self.run_id, self.shard_id, self.attempt, self.kind
        )
    }

    /// Prefix covering every blob of a run.
    pub fn run_prefix(run_id: &str) -> String {
        format!("{}/", run_id)
    }

    pub fn parse(path: &str) -> Option<Self> {
        let mut parts = path.split('/');
        let run_id = parts.next()?;
        let shard_id = parts.next()?;
        let attempt = parts.next()?.strip_prefix("attempt-")?.parse().ok()?;
        let kind = parts.next()?.strip_suffix(".jsonl")?;
        if parts.next().is_some() || run_id.is_empty() || shard_id.is_empty() || kind.is_empty() {
            return None;
        }
        Some(Self::new(run_id, shard_id, attempt, kind))
    }

    /// Reject ids that would escape the key layout.
    pub fn validate(&self) -> BlobResult<()> {
        for part in [&self.run_id, &self.shard_id, &self.kind] {
            if part.is_empty() || part.contains('/') || part.contains('\\') || part.starts_with('.') {
                return Err(BlobError::InvalidKey(self.path()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `key`. A second write to the same key fails with
    /// [`BlobError::AlreadyExists`].
    async fn put(&self, key: &BlobKey, bytes: Vec<u8>) -> BlobResult<()>;

    async fn get(&self, key: &BlobKey) -> BlobResult<Option<Vec<u8>>>;

    /// Keys whose path starts with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> BlobResult<Vec<BlobKey>>;
}

pub type BoxedBlobStore = Arc<dyn BlobStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_path_parses_back() {
        let key = BlobKey::new("run-7", "shard-000003", 2, SCORED_KIND);
        assert_eq!(key.path(), "run-7/shard-000003/attempt-0002/scored.jsonl");
        assert_eq!(BlobKey::parse(&key.path()), Some(key));
        assert_eq!(BlobKey::parse("run-7/shard-000003/scored.jsonl"), None);
    }

    #[test]
    fn traversal_rejected() {
        assert!(BlobKey::new("..", "s", 1, "scored").validate().is_err());
        assert!(BlobKey::new("r", "a/b", 1, "scored").validate().is_err());
        assert!(BlobKey::new("r", "s", 1, "scored").validate().is_ok());
    }
}
