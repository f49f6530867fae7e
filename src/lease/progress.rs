//! Run progress summary.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{AnnotationRun, ShardStatus, ShardTask};

/// A shard that exhausted its attempts.
#[derive(Debug, Clone, Serialize)]
pub struct FailedShard {
    pub shard_id: String,
    pub attempts: u32,
    pub reason: Option<String>,
}

/// Counts of shards per state for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub run: AnnotationRun,
    pub total: usize,
    pub unclaimed: usize,
    /// Claimed with a live lease.
    pub in_flight: usize,
    /// Claimed but the lease lapsed; reclaimable.
    pub expired: usize,
    pub complete: usize,
    pub failed: usize,
    pub failures: Vec<FailedShard>,
}

impl RunProgress {
    pub fn tally(run: AnnotationRun, shards: &[ShardTask], now: DateTime<Utc>) -> Self {
        let mut progress = Self {
            run,
            total: shards.len(),
            unclaimed: 0,
            in_flight: 0,
            expired: 0,
            complete: 0,
            failed: 0,
            failures: Vec::new(),
        };

        for shard in shards {
            match shard.status {
                ShardStatus::Unclaimed => progress.unclaimed += 1,
                ShardStatus::Claimed if shard.is_lease_expired(now) => progress.expired += 1,
                ShardStatus::Claimed => progress.in_flight += 1,
                ShardStatus::Complete => progress.complete += 1,
                ShardStatus::Failed => {
                    progress.failed += 1;
                    progress.failures.push(FailedShard {
                        shard_id: shard.shard_id.clone(),
                        attempts: shard.attempt_count,
                        reason: shard.last_error.clone(),
                    });
                }
            }
        }

        progress
    }

    /// Every shard is complete or failed.
    pub fn is_drained(&self) -> bool {
        self.complete + self.failed == self.total
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.complete + self.failed) as f64 * 100.0 / self.total as f64
    }
}
