//! Merge a run's shard outputs into a single JSONL stream.
//!
//! Only the blob written by the attempt recorded as `completed_attempt` on
//! the shard counts; outputs from attempts that lost their lease are
//! skipped. Lines that do not parse as valid scored items are quarantined.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::blob::{BlobError, BlobKey, BoxedBlobStore, SCORED_KIND};
use crate::models::{ScoredItem, ShardStatus};
use crate::shard_store::{BoxedShardStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Failed to encode merged output: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A line that could not be used.
#[derive(Debug, Clone)]
pub struct QuarantinedLine {
    pub shard_id: String,
    pub line: usize,
    pub reason: String,
}

/// Result of merging a run's outputs.
#[derive(Debug, Default)]
pub struct MergedExport {
    /// Items in shard id order, then line order.
    pub items: Vec<ScoredItem>,
    pub shards_merged: usize,
    /// Complete shards whose counted blob was missing.
    pub missing_shards: Vec<String>,
    /// Blobs from attempts that did not complete the shard.
    pub stale_blobs: usize,
    pub quarantined: Vec<QuarantinedLine>,
}

impl MergedExport {
    /// JSONL bytes of the merged items.
    pub fn to_jsonl(&self) -> Result<Vec<u8>, serde_json::Error> {
        crate::worker::encode_jsonl(&self.items)
    }

    /// Hex SHA-256 of the JSONL output, for comparing exports.
    pub fn digest(&self) -> Result<String, serde_json::Error> {
        let bytes = self.to_jsonl()?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Parse one JSONL payload, quarantining bad lines.
pub fn parse_scored_jsonl(
    shard_id: &str,
    bytes: &[u8],
    quarantined: &mut Vec<QuarantinedLine>,
) -> Vec<ScoredItem> {
    let text = String::from_utf8_lossy(bytes);
    let mut items = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<ScoredItem>(line)
            .map_err(|e| e.to_string())
            .and_then(|item| item.validate().map(|_| item).map_err(|e| e.to_string()));
        match parsed {
            Ok(item) => items.push(item),
            Err(reason) => {
                warn!(shard_id, line = idx + 1, "Quarantined malformed line: {}", reason);
                quarantined.push(QuarantinedLine {
                    shard_id: shard_id.to_string(),
                    line: idx + 1,
                    reason,
                });
            }
        }
    }
    items
}

/// Merge the counted output of every complete shard of `run_id`.
pub async fn merge_run_exports(
    shards: &BoxedShardStore,
    blobs: &BoxedBlobStore,
    run_id: &str,
) -> Result<MergedExport, ExportError> {
    if shards.get_run(run_id).await?.is_none() {
        return Err(ExportError::RunNotFound(run_id.to_string()));
    }

    let completed: HashMap<String, u32> = shards
        .list_shards(run_id, Some(ShardStatus::Complete))
        .await?
        .into_iter()
        .filter_map(|s| s.completed_attempt.map(|a| (s.shard_id, a)))
        .collect();

    let mut export = MergedExport::default();
    let mut counted: Vec<BlobKey> = Vec::new();
    for key in blobs.list(&BlobKey::run_prefix(run_id)).await? {
        if key.kind != SCORED_KIND {
            continue;
        }
        match completed.get(&key.shard_id) {
            Some(attempt) if *attempt == key.attempt => counted.push(key),
            _ => {
                debug!(key = %key, "Skipping output of non-completing attempt");
                export.stale_blobs += 1;
            }
        }
    }
    counted.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));

    let mut found: Vec<&str> = Vec::with_capacity(counted.len());
    for key in &counted {
        let Some(bytes) = blobs.get(key).await? else {
            continue;
        };
        let items = parse_scored_jsonl(&key.shard_id, &bytes, &mut export.quarantined);
        export.items.extend(items);
        export.shards_merged += 1;
        found.push(&key.shard_id);
    }

    let mut missing: Vec<String> = completed
        .keys()
        .filter(|id| !found.contains(&id.as_str()))
        .cloned()
        .collect();
    missing.sort();
    for shard_id in &missing {
        warn!(run_id, shard_id = %shard_id, "Complete shard has no output blob");
    }
    export.missing_shards = missing;

    info!(
        run_id,
        shards = export.shards_merged,
        items = export.items.len(),
        stale = export.stale_blobs,
        quarantined = export.quarantined.len(),
        "Merged run exports"
    );
    Ok(export)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use crate::blob::{BlobStore, InMemoryBlobStore};
    use crate::models::{AnnotationRun, RunConfig, ShardTask};
    use crate::shard_store::{InMemoryShardStore, Precondition, ShardStore};

    fn item_line(id: &str) -> String {
        format!(
            r#"{{"source_id":"{}","subreddit":"rust","timestamp":"2025-03-01T00:00:00Z","scores":{{"joy":0.5}}}}"#,
            id
        )
    }

    #[tokio::test]
    async fn keeps_only_completing_attempt_and_quarantines_bad_lines() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let store = InMemoryShardStore::new();
        let run = AnnotationRun::new(
            "run",
            RunConfig {
                model_id: "m".to_string(),
                source_dataset: "d".to_string(),
                revision: None,
                shard_size: 2,
                total_records: 4,
            },
            t0,
        );
        let s1 = ShardTask::new("run", "shard-000001", 0, 1, t0);
        let s2 = ShardTask::new("run", "shard-000002", 2, 3, t0);
        store.create_run(&run, &[s1.clone(), s2.clone()]).await.unwrap();

        // shard 1 completed on attempt 2; shard 2 completed on attempt 1.
        let s1_done = s1
            .claimed_by("a", t0, Duration::minutes(1))
            .claimed_by("b", t0, Duration::minutes(1))
            .completed(t0);
        store
            .update_if(&[Precondition::Version(0)], &s1_done)
            .await
            .unwrap()
            .unwrap();
        let s2_done = s2.claimed_by("a", t0, Duration::minutes(1)).completed(t0);
        store
            .update_if(&[Precondition::Version(0)], &s2_done)
            .await
            .unwrap()
            .unwrap();

        let blobs = InMemoryBlobStore::new();
        let put = |shard: &str, attempt: u32, body: String| {
            let blobs = blobs.clone();
            let key = BlobKey::new("run", shard, attempt, SCORED_KIND);
            async move { blobs.put(&key, body.into_bytes()).await.unwrap() }
        };
        put("shard-000001", 1, format!("{}\n", item_line("stale"))).await;
        put(
            "shard-000001",
            2,
            format!("{}\n{}\n", item_line("a"), item_line("b")),
        )
        .await;
        put(
            "shard-000002",
            1,
            format!("{}\n{{broken\n{}\n", item_line("c"), item_line("d")),
        )
        .await;

        let shards: BoxedShardStore = Arc::new(store);
        let blobs: BoxedBlobStore = Arc::new(blobs);
        let export = merge_run_exports(&shards, &blobs, "run").await.unwrap();

        let ids: Vec<_> = export.items.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(export.stale_blobs, 1);
        assert_eq!(export.shards_merged, 2);
        assert_eq!(export.quarantined.len(), 1);
        assert_eq!(export.quarantined[0].shard_id, "shard-000002");
        assert_eq!(export.quarantined[0].line, 2);
        assert!(export.missing_shards.is_empty());
        assert_eq!(export.digest().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn unknown_run_is_an_error() {
        let shards: BoxedShardStore = Arc::new(InMemoryShardStore::new());
        let blobs: BoxedBlobStore = Arc::new(InMemoryBlobStore::new());
        assert!(matches!(
            merge_run_exports(&shards, &blobs, "nope").await,
            Err(ExportError::RunNotFound(_))
        ));
    }

    #[test]
    fn out_of_range_scores_are_quarantined() {
        let mut quarantined = Vec::new();
        let line = r#"{"source_id":"x","subreddit":"rust","timestamp":"2025-03-01T00:00:00Z","scores":{"joy":3.0}}"#;
        let items = parse_scored_jsonl("shard-000001", line.as_bytes(), &mut quarantined);
        assert!(items.is_empty());
        assert_eq!(quarantined.len(), 1);
    }
}
