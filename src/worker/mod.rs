//! Annotation worker loop.
//!
//! A worker repeatedly claims a shard, scores its records in bounded batches,
//! writes the output blob for that attempt and then asks to complete the
//! shard. It stops after a run of empty polls or when the run is no longer
//! active.

mod batch;
mod input;

pub use batch::{next_batch_len, shrink, BatchLimits};
pub use input::{InMemoryInputSource, InputError, InputSource, JsonlInputSource};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::blob::{BlobError, BlobKey, BoxedBlobStore, SCORED_KIND};
use crate::lease::{LeaseError, LeaseManager, DEFAULT_LEASE_MINUTES};
use crate::models::{InputRecord, RunStatus, ScoredItem, ShardTask};
use crate::scoring::{prepare_for_input, truncate_chars, BoxedScorer, ScoringError};

/// Maximum characters of prepared text sent to the scorer per record.
pub const DEFAULT_MAX_TEXT_CHARS: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("Failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    ScorerUnavailable(ScoringError),
}

/// Worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub lease_minutes: i64,
    pub batch: BatchLimits,
    pub max_text_chars: usize,
    /// Consecutive empty claims before the run is considered drained.
    pub max_empty_polls: u32,
    pub poll_interval: Duration,
    /// How often a long shard renews its lease between batches.
    pub renew_interval: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            lease_minutes: DEFAULT_LEASE_MINUTES,
            batch: BatchLimits::default(),
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
            max_empty_polls: 3,
            poll_interval: Duration::from_secs(10),
            renew_interval: renew_interval_for(DEFAULT_LEASE_MINUTES),
        }
    }
}

/// Renew at half the lease.
pub fn renew_interval_for(lease_minutes: i64) -> Duration {
    Duration::from_secs(lease_minutes.max(1) as u64 * 30)
}

/// Progress events for display.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    ShardClaimed {
        shard_id: String,
        attempt: u32,
        records: u64,
    },
    BatchShrunk {
        shard_id: String,
        size: usize,
    },
    ShardCompleted {
        shard_id: String,
        items: usize,
    },
    ShardDiscarded {
        shard_id: String,
    },
    ShardFailed {
        shard_id: String,
        error: String,
    },
    Idle {
        empty_polls: u32,
    },
}

/// What happened to one claimed shard.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardOutcome {
    Completed { items: usize },
    /// Ownership was lost before completion; output ignored.
    Discarded,
    Failed { reason: String },
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    Drained,
    RunInactive(RunStatus),
}

#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub completed: usize,
    pub discarded: usize,
    pub failed: usize,
    pub items_scored: usize,
    pub batch_shrinks: usize,
    pub stop: StopReason,
    /// This worker's final check found every shard terminal.
    pub finalized: bool,
}

/// Why scoring a shard stopped early.
enum ShardError {
    Input(InputError),
    Scoring(ScoringError),
    LostLease,
    Lease(LeaseError),
}

impl std::fmt::Display for ShardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardError::Input(e) => write!(f, "{}", e),
            ShardError::Scoring(e) => write!(f, "{}", e),
            ShardError::LostLease => f.write_str("lease lost during scoring"),
            ShardError::Lease(e) => write!(f, "{}", e),
        }
    }
}

pub struct AnnotationWorker {
    leases: LeaseManager,
    input: Arc<dyn InputSource>,
    scorer: BoxedScorer,
    blobs: BoxedBlobStore,
    config: WorkerConfig,
    events: Option<mpsc::Sender<WorkerEvent>>,
}

impl AnnotationWorker {
    pub fn new(
        leases: LeaseManager,
        input: Arc<dyn InputSource>,
        scorer: BoxedScorer,
        blobs: BoxedBlobStore,
        config: WorkerConfig,
    ) -> Self {
        Self {
            leases,
            input,
            scorer,
            blobs,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::Sender<WorkerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    async fn emit(&self, event: WorkerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Work `run_id` until it drains or stops being active.
    ///
    /// Store, blob and scorer-availability failures abort the loop; an
    /// aborted shard keeps its claim until the lease lapses. Shard-level
    /// failures are recorded on the shard and the loop moves on.
    pub async fn run(&self, run_id: &str) -> Result<WorkerReport, WorkerError> {
        let worker_id = self.config.worker_id.as_str();
        let mut report = WorkerReport::default();
        let mut empty_polls = 0u32;

        info!(run_id, worker_id, "Worker started");
        loop {
            let status = self.leases.run_state(run_id).await?;
            if !status.is_active() {
                info!(run_id, worker_id, status = status.as_str(), "Run no longer active, stopping");
                report.stop = StopReason::RunInactive(status);
                break;
            }

            let claimed = self
                .leases
                .claim_shard(run_id, worker_id, self.config.lease_minutes)
                .await?;
            let Some(task) = claimed else {
                empty_polls += 1;
                self.emit(WorkerEvent::Idle { empty_polls }).await;
                if empty_polls >= self.config.max_empty_polls {
                    info!(run_id, worker_id, empty_polls, "No claimable shards, run drained");
                    break;
                }
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            };
            empty_polls = 0;

            match self.process_shard(&task, &mut report).await? {
                ShardOutcome::Completed { items } => {
                    report.completed += 1;
                    report.items_scored += items;
                }
                ShardOutcome::Discarded => report.discarded += 1,
                ShardOutcome::Failed { .. } => report.failed += 1,
            }
        }

        if report.stop == StopReason::Drained {
            report.finalized = self.leases.finalize_run(run_id).await?;
        }
        info!(
            run_id,
            worker_id,
            completed = report.completed,
            discarded = report.discarded,
            failed = report.failed,
            "Worker finished"
        );
        Ok(report)
    }

    /// Score, persist and complete one claimed shard.
    pub async fn process_shard(
        &self,
        task: &ShardTask,
        report: &mut WorkerReport,
    ) -> Result<ShardOutcome, WorkerError> {
        let worker_id = self.config.worker_id.as_str();
        self.emit(WorkerEvent::ShardClaimed {
            shard_id: task.shard_id.clone(),
            attempt: task.attempt_count,
            records: task.record_count(),
        })
        .await;

        let scored = match self.input.read_range(task.start_idx, task.end_idx).await {
            Ok(records) => self.score_records(task, &records, report).await,
            Err(e) => Err(ShardError::Input(e)),
        };

        let items = match scored {
            Ok(items) => items,
            Err(ShardError::LostLease) => {
                warn!(run_id = %task.run_id, shard_id = %task.shard_id, worker_id, "Lease lost mid-shard, abandoning");
                self.emit(WorkerEvent::ShardDiscarded {
                    shard_id: task.shard_id.clone(),
                })
                .await;
                return Ok(ShardOutcome::Discarded);
            }
            Err(ShardError::Lease(e)) => return Err(e.into()),
            Err(ShardError::Scoring(e)) if e.is_unavailable() => {
                warn!(
                    run_id = %task.run_id,
                    shard_id = %task.shard_id,
                    worker_id,
                    "Scorer unavailable, leaving shard to its lease: {}",
                    e
                );
                return Err(WorkerError::ScorerUnavailable(e));
            }
            Err(e) => return self.fail(task, e.to_string()).await,
        };

        let payload = encode_jsonl(&items)?;
        let key = BlobKey::new(&task.run_id, &task.shard_id, task.attempt_count, SCORED_KIND);
        match self.blobs.put(&key, payload).await {
            Ok(()) => {}
            Err(BlobError::AlreadyExists(path)) => {
                return self
                    .fail(task, format!("output already written at {}", path))
                    .await;
            }
            Err(e) => return Err(e.into()),
        }

        if self
            .leases
            .complete_shard(&task.run_id, &task.shard_id, worker_id)
            .await?
        {
            self.emit(WorkerEvent::ShardCompleted {
                shard_id: task.shard_id.clone(),
                items: items.len(),
            })
            .await;
            Ok(ShardOutcome::Completed { items: items.len() })
        } else {
            // The blob stays under this attempt's key; export ignores it.
            self.emit(WorkerEvent::ShardDiscarded {
                shard_id: task.shard_id.clone(),
            })
            .await;
            Ok(ShardOutcome::Discarded)
        }
    }

    async fn fail(&self, task: &ShardTask, reason: String) -> Result<ShardOutcome, WorkerError> {
        warn!(
            run_id = %task.run_id,
            shard_id = %task.shard_id,
            worker_id = %self.config.worker_id,
            attempt = task.attempt_count,
            "Shard attempt failed: {}",
            reason
        );
        let released = self
            .leases
            .fail_shard(&task.run_id, &task.shard_id, &self.config.worker_id, &reason)
            .await?;
        if !released {
            // Someone else holds the shard now; this attempt just ends.
            self.emit(WorkerEvent::ShardDiscarded {
                shard_id: task.shard_id.clone(),
            })
            .await;
            return Ok(ShardOutcome::Discarded);
        }
        self.emit(WorkerEvent::ShardFailed {
            shard_id: task.shard_id.clone(),
            error: reason.clone(),
        })
        .await;
        Ok(ShardOutcome::Failed { reason })
    }

    /// Score records in order, shrinking the batch on resource exhaustion.
    ///
    /// The batch size starts from the configured default for every shard.
    async fn score_records(
        &self,
        task: &ShardTask,
        records: &[InputRecord],
        report: &mut WorkerReport,
    ) -> Result<Vec<ScoredItem>, ShardError> {
        let texts: Vec<String> = records
            .iter()
            .map(|r| {
                let text = prepare_for_input(&r.title, &r.body, &r.comments);
                truncate_chars(&text, self.config.max_text_chars).to_string()
            })
            .collect();

        let model_id = self.scorer.model_id().to_string();
        let mut batch_size = self.config.batch.max_records.max(1);
        let mut items = Vec::with_capacity(records.len());
        let mut pos = 0usize;
        let renew_every = self.config.renew_interval;
        let mut last_renewal = Instant::now();

        while pos < texts.len() {
            let len = next_batch_len(&texts[pos..], batch_size, self.config.batch.max_chars);
            let batch = &texts[pos..pos + len];

            match self.scorer.score(batch).await {
                Ok(scores) if scores.len() == len => {
                    items.extend(
                        records[pos..pos + len]
                            .iter()
                            .zip(scores)
                            .map(|(record, scores)| ScoredItem::from_record(record, scores, &model_id)),
                    );
                    pos += len;
                }
                Ok(scores) => {
                    return Err(ShardError::Scoring(ScoringError::LengthMismatch {
                        expected: len,
                        got: scores.len(),
                    }));
                }
                Err(e) if e.is_resource_exhausted() && len > 1 => {
                    batch_size = shrink(len);
                    report.batch_shrinks += 1;
                    debug!(shard_id = %task.shard_id, batch_size, "Resource exhausted, shrinking batch");
                    self.emit(WorkerEvent::BatchShrunk {
                        shard_id: task.shard_id.clone(),
                        size: batch_size,
                    })
                    .await;
                }
                Err(e) => return Err(ShardError::Scoring(e)),
            }

            if pos < texts.len() && last_renewal.elapsed() >= renew_every {
                let renewed = self
                    .leases
                    .renew_lease(
                        &task.run_id,
                        &task.shard_id,
                        &self.config.worker_id,
                        self.config.lease_minutes,
                    )
                    .await
                    .map_err(ShardError::Lease)?;
                if !renewed {
                    return Err(ShardError::LostLease);
                }
                last_renewal = Instant::now();
            }
        }

        Ok(items)
    }
}

/// One JSON object per line, in input order.
pub fn encode_jsonl(items: &[ScoredItem]) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    for item in items {
        serde_json::to_writer(&mut out, item)?;
        out.push(b'\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use crate::blob::{BlobStore, InMemoryBlobStore};
    use crate::clock::ManualClock;
    use crate::lease::LeaseConfig;
    use crate::models::{EmotionScores, Emotion, RunConfig, ShardStatus};
    use crate::scoring::ScoringFunction;
    use crate::shard_store::{InMemoryShardStore, ShardStore};

    /// Scores by text length; batches larger than `capacity` exhaust resources.
    struct FakeScorer {
        capacity: usize,
        fail_marker: Option<&'static str>,
        calls: Mutex<Vec<usize>>,
    }

    impl FakeScorer {
        fn new(capacity: usize) -> Self {
            Self {
                capacity,
                fail_marker: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<usize> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ScoringFunction for FakeScorer {
        fn model_id(&self) -> &str {
            "fake-model"
        }

        async fn score(&self, texts: &[String]) -> Result<Vec<EmotionScores>, ScoringError> {
            self.calls.lock().unwrap().push(texts.len());
            if texts.len() > self.capacity {
                return Err(ScoringError::ResourceExhausted("CUDA out of memory".to_string()));
            }
            if let Some(marker) = self.fail_marker {
                if texts.iter().any(|t| t.contains(marker)) {
                    return Err(ScoringError::Failed("model crashed".to_string()));
                }
            }
            Ok(texts
                .iter()
                .map(|t| EmotionScores::new().with(Emotion::Joy, (t.len() % 10) as f64 / 10.0))
                .collect())
        }
    }

    fn records(n: usize) -> Vec<InputRecord> {
        (0..n)
            .map(|i| InputRecord {
                id: format!("t3_{}", i),
                subreddit: "rust".to_string(),
                topic: None,
                created_utc: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
                title: format!("post number {}", i),
                body: String::new(),
                comments: Vec::new(),
                score: Some(i as i64),
            })
            .collect()
    }

    struct Harness {
        leases: LeaseManager,
        store: InMemoryShardStore,
        blobs: InMemoryBlobStore,
        input: Arc<InMemoryInputSource>,
    }

    async fn harness(total: usize, shard_size: u64, max_attempts: u32) -> Harness {
        let store = InMemoryShardStore::new();
        let leases = LeaseManager::new(
            Arc::new(store.clone()),
            LeaseConfig {
                max_attempts,
                ..LeaseConfig::default()
            },
        );
        leases
            .create_run(
                "run",
                RunConfig {
                    model_id: "fake-model".to_string(),
                    source_dataset: "memory".to_string(),
                    revision: None,
                    shard_size,
                    total_records: total as u64,
                },
            )
            .await
            .unwrap();
        Harness {
            leases,
            store,
            blobs: InMemoryBlobStore::new(),
            input: Arc::new(InMemoryInputSource::new(records(total))),
        }
    }

    fn fast_config(worker_id: &str, max_records: usize) -> WorkerConfig {
        WorkerConfig {
            batch: BatchLimits {
                max_records,
                max_chars: 10_000,
            },
            max_empty_polls: 1,
            poll_interval: Duration::from_millis(1),
            ..WorkerConfig::new(worker_id)
        }
    }

    impl Harness {
        fn worker(&self, scorer: Arc<FakeScorer>, config: WorkerConfig) -> AnnotationWorker {
            AnnotationWorker::new(
                self.leases.clone(),
                self.input.clone(),
                scorer,
                Arc::new(self.blobs.clone()),
                config,
            )
        }
    }

    #[tokio::test]
    async fn two_workers_drain_three_shards_without_overlap() {
        let h = harness(9, 3, 3).await;
        let scorer = Arc::new(FakeScorer::new(32));
        let a = h.worker(scorer.clone(), fast_config("worker-a", 8));
        let b = h.worker(scorer.clone(), fast_config("worker-b", 8));

        let (ra, rb) = tokio::join!(a.run("run"), b.run("run"));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.completed + rb.completed, 3);
        assert_eq!(ra.items_scored + rb.items_scored, 9);

        for shard in h.store.list_shards("run", None).await.unwrap() {
            assert_eq!(shard.status, ShardStatus::Complete);
            assert_eq!(shard.attempt_count, 1);
            assert_eq!(shard.completed_attempt, Some(1));
        }
        assert_eq!(h.blobs.list("run/").await.unwrap().len(), 3);
        assert!(ra.finalized || rb.finalized);
        assert_eq!(h.leases.run_state("run").await.unwrap(), RunStatus::Complete);
    }

    #[tokio::test]
    async fn batch_shrinks_on_exhaustion_and_resets_per_shard() {
        let h = harness(8, 4, 3).await;
        let scorer = Arc::new(FakeScorer::new(2));
        let worker = h.worker(scorer.clone(), fast_config("w", 4));

        let report = worker.run("run").await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(report.items_scored, 8);
        assert_eq!(report.batch_shrinks, 2);
        // Each shard starts again at the configured size.
        assert_eq!(scorer.calls(), vec![4, 2, 2, 4, 2, 2]);
    }

    #[tokio::test]
    async fn exhaustion_at_single_record_fails_the_shard() {
        let h = harness(2, 2, 1).await;
        let scorer = Arc::new(FakeScorer::new(0));
        let worker = h.worker(scorer, fast_config("w", 2));

        let report = worker.run("run").await.unwrap();
        assert_eq!(report.failed, 1);
        let shard = h.store.get_shard("run", "shard-000001").await.unwrap().unwrap();
        assert_eq!(shard.status, ShardStatus::Failed);
        assert!(shard.last_error.unwrap().contains("exhausted"));
    }

    #[tokio::test]
    async fn scoring_failure_releases_for_retry() {
        let h = harness(3, 3, 3).await;
        let scorer = Arc::new(FakeScorer {
            fail_marker: Some("number 1"),
            ..FakeScorer::new(32)
        });
        let worker = h.worker(scorer, fast_config("w", 8));

        let report = worker.run("run").await.unwrap();
        // Two claims, both failed; each failure also counts, so the shard
        // ends terminal at attempt 4.
        assert_eq!(report.failed, 2);
        assert_eq!(report.completed, 0);
        let progress = h.leases.run_status("run").await.unwrap();
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.failures[0].attempts, 4);
    }

    struct DownScorer;

    #[async_trait]
    impl ScoringFunction for DownScorer {
        fn model_id(&self) -> &str {
            "fake-model"
        }

        async fn score(&self, _texts: &[String]) -> Result<Vec<EmotionScores>, ScoringError> {
            Err(ScoringError::Connection("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn scorer_outage_stops_worker_without_spending_attempts() {
        let h = harness(9, 3, 3).await;
        let worker = AnnotationWorker::new(
            h.leases.clone(),
            h.input.clone(),
            Arc::new(DownScorer),
            Arc::new(h.blobs.clone()),
            fast_config("w", 8),
        );

        let err = worker.run("run").await.unwrap_err();
        assert!(matches!(err, WorkerError::ScorerUnavailable(ScoringError::Connection(_))));

        let shards = h.store.list_shards("run", None).await.unwrap();
        assert!(shards.iter().all(|s| s.status != ShardStatus::Failed));
        let claimed: Vec<_> = shards
            .iter()
            .filter(|s| s.status == ShardStatus::Claimed)
            .collect();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt_count, 1);
        assert_eq!(h.leases.run_state("run").await.unwrap(), RunStatus::Active);
    }

    #[tokio::test]
    async fn cancelled_run_stops_the_loop() {
        let h = harness(6, 3, 3).await;
        h.leases.cancel_run("run").await.unwrap();
        let worker = h.worker(Arc::new(FakeScorer::new(32)), fast_config("w", 8));

        let report = worker.run("run").await.unwrap();
        assert_eq!(report.stop, StopReason::RunInactive(RunStatus::Cancelled));
        assert_eq!(report.completed, 0);
        assert!(h.blobs.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_after_reclaim_is_discarded() {
        let h = harness(3, 3, 3).await;
        let stale = h.leases.claim_shard("run", "stale", 1).await.unwrap().unwrap();

        // Simulate lease expiry and a reclaim by another worker.
        let expired = ShardTask {
            lease_expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
            ..stale.clone()
        };
        h.store
            .update_if(&[crate::shard_store::Precondition::Version(stale.version)], &expired)
            .await
            .unwrap()
            .unwrap();
        let fresh = h.leases.claim_shard("run", "fresh", 30).await.unwrap().unwrap();
        assert_eq!(fresh.attempt_count, 2);

        let worker = h.worker(Arc::new(FakeScorer::new(32)), fast_config("stale", 8));
        let mut report = WorkerReport::default();
        let outcome = worker.process_shard(&stale, &mut report).await.unwrap();
        assert_eq!(outcome, ShardOutcome::Discarded);

        let shard = h.store.get_shard("run", &stale.shard_id).await.unwrap().unwrap();
        assert_eq!(shard.status, ShardStatus::Claimed);
        assert_eq!(shard.owner.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn failure_after_reclaim_is_discarded() {
        let h = harness(3, 3, 3).await;
        let stale = h.leases.claim_shard("run", "stale", 1).await.unwrap().unwrap();
        let expired = ShardTask {
            lease_expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
            ..stale.clone()
        };
        h.store
            .update_if(&[crate::shard_store::Precondition::Version(stale.version)], &expired)
            .await
            .unwrap()
            .unwrap();
        h.leases.claim_shard("run", "fresh", 30).await.unwrap().unwrap();

        let scorer = Arc::new(FakeScorer {
            fail_marker: Some("number"),
            ..FakeScorer::new(32)
        });
        let worker = h.worker(scorer, fast_config("stale", 8));
        let mut report = WorkerReport::default();
        let outcome = worker.process_shard(&stale, &mut report).await.unwrap();
        assert_eq!(outcome, ShardOutcome::Discarded);

        let shard = h.store.get_shard("run", &stale.shard_id).await.unwrap().unwrap();
        assert_eq!(shard.status, ShardStatus::Claimed);
        assert_eq!(shard.owner.as_deref(), Some("fresh"));
        assert_eq!(shard.attempt_count, 2);
        assert_eq!(shard.last_error, None);
    }

    /// Advances the clock on every call; on one call a rival tries to take
    /// the shard.
    struct SlowScorer {
        clock: Arc<ManualClock>,
        step: chrono::Duration,
        rival: LeaseManager,
        steal_on_call: usize,
        calls: Mutex<usize>,
        stolen: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl ScoringFunction for SlowScorer {
        fn model_id(&self) -> &str {
            "fake-model"
        }

        async fn score(&self, texts: &[String]) -> Result<Vec<EmotionScores>, ScoringError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            self.clock.advance(self.step);
            if call == self.steal_on_call {
                let got = self
                    .rival
                    .claim_shard("run", "rival", 1)
                    .await
                    .unwrap()
                    .is_some();
                *self.stolen.lock().unwrap() = Some(got);
            }
            Ok(texts
                .iter()
                .map(|_| EmotionScores::new().with(Emotion::Joy, 0.5))
                .collect())
        }
    }

    struct Clocked {
        leases: LeaseManager,
        clock: Arc<ManualClock>,
        store: InMemoryShardStore,
        blobs: InMemoryBlobStore,
    }

    async fn clocked(total: usize) -> Clocked {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        ));
        let store = InMemoryShardStore::new();
        let leases = LeaseManager::with_clock(
            Arc::new(store.clone()),
            LeaseConfig::default(),
            clock.clone(),
        );
        leases
            .create_run(
                "run",
                RunConfig {
                    model_id: "fake-model".to_string(),
                    source_dataset: "memory".to_string(),
                    revision: None,
                    shard_size: total as u64,
                    total_records: total as u64,
                },
            )
            .await
            .unwrap();
        Clocked {
            leases,
            clock,
            store,
            blobs: InMemoryBlobStore::new(),
        }
    }

    impl Clocked {
        fn slow_scorer(&self, step: chrono::Duration, steal_on_call: usize) -> Arc<SlowScorer> {
            Arc::new(SlowScorer {
                clock: self.clock.clone(),
                step,
                rival: self.leases.clone(),
                steal_on_call,
                calls: Mutex::new(0),
                stolen: Mutex::new(None),
            })
        }

        fn worker(&self, scorer: Arc<SlowScorer>, total: usize) -> AnnotationWorker {
            AnnotationWorker::new(
                self.leases.clone(),
                Arc::new(InMemoryInputSource::new(records(total))),
                scorer,
                Arc::new(self.blobs.clone()),
                WorkerConfig {
                    lease_minutes: 1,
                    renew_interval: Duration::ZERO,
                    ..fast_config("w", 1)
                },
            )
        }
    }

    #[tokio::test]
    async fn long_shard_renews_its_lease_between_batches() {
        let c = clocked(3).await;
        // Three 40s batches outlast a one-minute lease unless it is renewed.
        let scorer = c.slow_scorer(chrono::Duration::seconds(40), 3);
        let worker = c.worker(scorer.clone(), 3);
        let task = c.leases.claim_shard("run", "w", 1).await.unwrap().unwrap();

        let mut report = WorkerReport::default();
        let outcome = worker.process_shard(&task, &mut report).await.unwrap();
        assert_eq!(*scorer.stolen.lock().unwrap(), Some(false));
        assert_eq!(outcome, ShardOutcome::Completed { items: 3 });

        let shard = c.store.get_shard("run", &task.shard_id).await.unwrap().unwrap();
        assert_eq!(shard.status, ShardStatus::Complete);
        assert_eq!(shard.completed_attempt, Some(1));
    }

    #[tokio::test]
    async fn lease_lost_mid_shard_abandons_without_output() {
        let c = clocked(3).await;
        let scorer = c.slow_scorer(chrono::Duration::minutes(2), 1);
        let worker = c.worker(scorer.clone(), 3);
        let task = c.leases.claim_shard("run", "w", 1).await.unwrap().unwrap();

        let mut report = WorkerReport::default();
        let outcome = worker.process_shard(&task, &mut report).await.unwrap();
        assert_eq!(*scorer.stolen.lock().unwrap(), Some(true));
        assert_eq!(outcome, ShardOutcome::Discarded);
        assert_eq!(*scorer.calls.lock().unwrap(), 1);

        let shard = c.store.get_shard("run", &task.shard_id).await.unwrap().unwrap();
        assert_eq!(shard.owner.as_deref(), Some("rival"));
        assert_eq!(shard.attempt_count, 2);
        assert!(c.blobs.list("run/").await.unwrap().is_empty());
    }

    #[test]
    fn jsonl_has_one_line_per_item() {
        let items: Vec<ScoredItem> = records(2)
            .iter()
            .map(|r| ScoredItem::from_record(r, EmotionScores::new().with(Emotion::Fear, 0.5), "m"))
            .collect();
        let bytes = encode_jsonl(&items).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }
}
