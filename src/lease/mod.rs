//! Lease manager: single-owner shard claims with time-bounded leases.
//!
//! Workers never talk to each other. A claim is a conditional write against
//! the shard document's version; losing that race just means trying the
//! next candidate. A crashed worker's shard becomes claimable again once its
//! lease lapses, and its late `complete_shard` is refused because the owner
//! field no longer matches.

mod progress;

pub use progress::RunProgress;

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::models::{shard_id_for, AnnotationRun, RunConfig, RunStatus, ShardStatus, ShardTask};
use crate::shard_store::{BoxedShardStore, Precondition, StoreError};

/// Default lease duration in minutes.
pub const DEFAULT_LEASE_MINUTES: i64 = 30;
/// Default number of claims a shard may consume before it is failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Candidates fetched per claim scan.
pub const CLAIM_SCAN_WINDOW: usize = 25;

/// Errors from lease operations.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Shard not found: {run_id}/{shard_id}")]
    ShardNotFound { run_id: String, shard_id: String },

    #[error("Invalid run configuration: {0}")]
    InvalidRun(String),
}

pub type LeaseResult<T> = Result<T, LeaseError>;

/// Tunables for the claim protocol.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Claims a shard may consume before being marked failed.
    pub max_attempts: u32,
    /// Candidates fetched per scan.
    pub scan_window: usize,
    /// Rescans allowed after losing every race in a window.
    pub max_scans: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scan_window: CLAIM_SCAN_WINDOW,
            max_scans: 8,
        }
    }
}

/// Coordinates shard ownership through a [`ShardStore`](crate::shard_store::ShardStore).
#[derive(Clone)]
pub struct LeaseManager {
    store: BoxedShardStore,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(store: BoxedShardStore, config: LeaseConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: BoxedShardStore, config: LeaseConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &BoxedShardStore {
        &self.store
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Create a run and split its dataset into shards of `shard_size` records.
    pub async fn create_run(&self, run_id: &str, config: RunConfig) -> LeaseResult<AnnotationRun> {
        if run_id.trim().is_empty() {
            return Err(LeaseError::InvalidRun("run id is empty".to_string()));
        }
        if config.shard_size == 0 {
            return Err(LeaseError::InvalidRun("shard size must be positive".to_string()));
        }

        let now = self.clock.now();
        let run = AnnotationRun::new(run_id, config, now);
        let shards = plan_shards(&run, now);
        self.store.create_run(&run, &shards).await?;

        info!(
            run_id = %run.run_id,
            shards = shards.len(),
            records = run.config.total_records,
            "Created annotation run"
        );
        Ok(run)
    }

    /// Claim one shard for `worker_id`.
    ///
    /// Returns `None` when the run is not active or every remaining shard is
    /// terminal or held by a live lease.
    pub async fn claim_shard(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_minutes: i64,
    ) -> LeaseResult<Option<ShardTask>> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| LeaseError::RunNotFound(run_id.to_string()))?;
        if !run.status.is_active() {
            debug!(run_id, status = run.status.as_str(), "Run not active, nothing to claim");
            return Ok(None);
        }

        let lease = Duration::minutes(lease_minutes.max(1));

        for scan in 0..self.config.max_scans {
            let now = self.clock.now();
            let candidates = self
                .store
                .list_claimable(run_id, now, self.config.scan_window)
                .await?;
            if candidates.is_empty() {
                return Ok(None);
            }

            let mut contended = false;
            for candidate in candidates {
                if candidate.status == ShardStatus::Claimed
                    && candidate.attempt_count >= self.config.max_attempts
                {
                    contended |= !self.expire_exhausted(&candidate, now).await?;
                    continue;
                }

                let next = candidate.claimed_by(worker_id, now, lease);
                let expected = [
                    Precondition::Version(candidate.version),
                    Precondition::Claimable(now),
                ];
                match self.store.update_if(&expected, &next).await? {
                    Some(task) => {
                        if candidate.status == ShardStatus::Claimed {
                            info!(
                                run_id,
                                shard_id = %task.shard_id,
                                worker_id,
                                previous_owner = candidate.owner.as_deref().unwrap_or(""),
                                attempt = task.attempt_count,
                                "Reclaimed shard with expired lease"
                            );
                        } else {
                            info!(
                                run_id,
                                shard_id = %task.shard_id,
                                worker_id,
                                attempt = task.attempt_count,
                                "Claimed shard"
                            );
                        }
                        return Ok(Some(task));
                    }
                    None => {
                        debug!(run_id, shard_id = %candidate.shard_id, worker_id, "Lost claim race");
                        contended = true;
                    }
                }
            }

            if !contended {
                // Only exhausted shards were in the window and they are failed now.
                debug!(run_id, scan, "Scan window drained, rescanning");
            }
        }

        warn!(run_id, worker_id, "Gave up claiming after repeated contention");
        Ok(None)
    }

    /// Mark an expired shard that already spent its attempts as failed.
    /// Returns false if another writer touched it first.
    async fn expire_exhausted(
        &self,
        task: &ShardTask,
        now: chrono::DateTime<chrono::Utc>,
    ) -> LeaseResult<bool> {
        let reason = format!(
            "lease expired on attempt {} of {}",
            task.attempt_count, self.config.max_attempts
        );
        let next = ShardTask {
            status: ShardStatus::Failed,
            owner: None,
            lease_expires_at: None,
            last_error: Some(reason.clone()),
            updated_at: now,
            ..task.clone()
        };
        let expected = [
            Precondition::Version(task.version),
            Precondition::Claimable(now),
        ];
        let failed = self.store.update_if(&expected, &next).await?.is_some();
        if failed {
            warn!(
                run_id = %task.run_id,
                shard_id = %task.shard_id,
                attempts = task.attempt_count,
                "Shard failed: {}",
                reason
            );
        }
        Ok(failed)
    }

    /// Mark a shard complete. Returns false, without mutating anything, if
    /// `worker_id` no longer owns the claim; the caller must discard its output.
    pub async fn complete_shard(
        &self,
        run_id: &str,
        shard_id: &str,
        worker_id: &str,
    ) -> LeaseResult<bool> {
        let task = self.require_shard(run_id, shard_id).await?;
        if task.status != ShardStatus::Claimed || !task.is_owned_by(worker_id) {
            warn!(
                run_id,
                shard_id,
                worker_id,
                owner = task.owner.as_deref().unwrap_or(""),
                status = task.status.as_str(),
                "Completion refused, claim no longer held"
            );
            return Ok(false);
        }

        let now = self.clock.now();
        let expected = [
            Precondition::Version(task.version),
            Precondition::Status(ShardStatus::Claimed),
            Precondition::OwnedBy(worker_id.to_string()),
        ];
        match self.store.update_if(&expected, &task.completed(now)).await? {
            Some(done) => {
                info!(
                    run_id,
                    shard_id,
                    worker_id,
                    attempt = done.completed_attempt.unwrap_or(0),
                    "Shard complete"
                );
                Ok(true)
            }
            None => {
                warn!(run_id, shard_id, worker_id, "Completion lost race with reclaim");
                Ok(false)
            }
        }
    }

    /// Release a failed attempt. Only the owner may fail a shard.
    ///
    /// The failure adds one to the attempt count on top of the claim; once
    /// the count reaches `max_attempts` the shard becomes terminally failed.
    pub async fn fail_shard(
        &self,
        run_id: &str,
        shard_id: &str,
        worker_id: &str,
        reason: &str,
    ) -> LeaseResult<bool> {
        let task = self.require_shard(run_id, shard_id).await?;
        if task.status != ShardStatus::Claimed || !task.is_owned_by(worker_id) {
            debug!(run_id, shard_id, worker_id, "Fail ignored, caller is not the owner");
            return Ok(false);
        }

        let now = self.clock.now();
        let next = task.released_after_failure(reason, self.config.max_attempts, now);
        let expected = [
            Precondition::Version(task.version),
            Precondition::Status(ShardStatus::Claimed),
            Precondition::OwnedBy(worker_id.to_string()),
        ];
        let Some(stored) = self.store.update_if(&expected, &next).await? else {
            return Ok(false);
        };

        if stored.status == ShardStatus::Failed {
            warn!(
                run_id,
                shard_id,
                attempts = stored.attempt_count,
                "Shard failed permanently: {}",
                reason
            );
        } else {
            info!(
                run_id,
                shard_id,
                worker_id,
                attempt = stored.attempt_count,
                "Shard released for retry: {}",
                reason
            );
        }
        Ok(true)
    }

    /// Extend the owner's lease. Returns false if the claim was lost.
    pub async fn renew_lease(
        &self,
        run_id: &str,
        shard_id: &str,
        worker_id: &str,
        lease_minutes: i64,
    ) -> LeaseResult<bool> {
        let task = self.require_shard(run_id, shard_id).await?;
        if task.status != ShardStatus::Claimed || !task.is_owned_by(worker_id) {
            return Ok(false);
        }

        let now = self.clock.now();
        let next = ShardTask {
            lease_expires_at: Some(now + Duration::minutes(lease_minutes.max(1))),
            updated_at: now,
            ..task.clone()
        };
        let expected = [
            Precondition::Version(task.version),
            Precondition::OwnedBy(worker_id.to_string()),
        ];
        let renewed = self.store.update_if(&expected, &next).await?.is_some();
        if renewed {
            debug!(run_id, shard_id, worker_id, "Lease renewed");
        }
        Ok(renewed)
    }

    /// Per-status counts and failures for a run.
    pub async fn run_status(&self, run_id: &str) -> LeaseResult<RunProgress> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| LeaseError::RunNotFound(run_id.to_string()))?;
        let shards = self.store.list_shards(run_id, None).await?;
        Ok(RunProgress::tally(run, &shards, self.clock.now()))
    }

    /// Current run status, for workers polling for cancellation.
    pub async fn run_state(&self, run_id: &str) -> LeaseResult<RunStatus> {
        self.store
            .get_run(run_id)
            .await?
            .map(|r| r.status)
            .ok_or_else(|| LeaseError::RunNotFound(run_id.to_string()))
    }

    /// Mark an active run cancelled; workers exit on their next poll.
    ///
    /// Returns false if the run already finished or was cancelled.
    pub async fn cancel_run(&self, run_id: &str) -> LeaseResult<bool> {
        let cancelled = self
            .store
            .set_run_status(run_id, RunStatus::Active, RunStatus::Cancelled)
            .await
            .map_err(|e| match e {
                StoreError::RunNotFound(id) => LeaseError::RunNotFound(id),
                other => other.into(),
            })?;
        if cancelled {
            info!(run_id, "Run cancelled");
        } else {
            debug!(run_id, "Cancel ignored, run is not active");
        }
        Ok(cancelled)
    }

    /// Mark an active run complete once every shard is terminal.
    pub async fn finalize_run(&self, run_id: &str) -> LeaseResult<bool> {
        let progress = self.run_status(run_id).await?;
        if !progress.run.status.is_active() || !progress.is_drained() {
            return Ok(false);
        }
        let finalized = self
            .store
            .set_run_status(run_id, RunStatus::Active, RunStatus::Complete)
            .await?;
        if !finalized {
            debug!(run_id, "Run left active state before finalizing");
            return Ok(false);
        }
        info!(
            run_id,
            complete = progress.complete,
            failed = progress.failed,
            "Run finalized"
        );
        Ok(true)
    }

    async fn require_shard(&self, run_id: &str, shard_id: &str) -> LeaseResult<ShardTask> {
        self.store
            .get_shard(run_id, shard_id)
            .await?
            .ok_or_else(|| LeaseError::ShardNotFound {
                run_id: run_id.to_string(),
                shard_id: shard_id.to_string(),
            })
    }
}

/// Split a run's dataset into inclusive, contiguous shard ranges.
pub fn plan_shards(run: &AnnotationRun, now: chrono::DateTime<chrono::Utc>) -> Vec<ShardTask> {
    let total = run.config.total_records;
    let size = run.config.shard_size;
    (0..run.shard_count())
        .map(|i| {
            let start = i * size;
            let end = (start + size).min(total) - 1;
            ShardTask::new(&run.run_id, shard_id_for(i), start, end, now)
        })
        .collect()
}
