//! In-memory shard store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::backend::{Precondition, ShardStore, StoreError, StoreResult};
use crate::models::{AnnotationRun, RunStatus, ShardStatus, ShardTask};

struct RunEntry {
    run: AnnotationRun,
    shards: BTreeMap<String, ShardTask>,
}

/// Shard store held in process memory.
///
/// Conditional writes are serialized by a single write lock, which gives the
/// same all-or-nothing behavior as the SQLite backend's immediate
/// transactions.
#[derive(Clone, Default)]
pub struct InMemoryShardStore {
    runs: Arc<RwLock<HashMap<String, RunEntry>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ShardStore for InMemoryShardStore {
    async fn create_run(&self, run: &AnnotationRun, shards: &[ShardTask]) -> StoreResult<()> {
        self.check_available()?;
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.run_id) {
            return Err(StoreError::RunExists(run.run_id.clone()));
        }
        let shards = shards
            .iter()
            .map(|s| (s.shard_id.clone(), s.clone()))
            .collect();
        runs.insert(
            run.run_id.clone(),
            RunEntry {
                run: run.clone(),
                shards,
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<AnnotationRun>> {
        self.check_available()?;
        let runs = self.runs.read().await;
        Ok(runs.get(run_id).map(|e| e.run.clone()))
    }

    async fn set_run_status(
        &self,
        run_id: &str,
        expected: RunStatus,
        status: RunStatus,
    ) -> StoreResult<bool> {
        self.check_available()?;
        let mut runs = self.runs.write().await;
        let entry = runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        if entry.run.status != expected {
            return Ok(false);
        }
        entry.run.status = status;
        Ok(true)
    }

    async fn get_shard(&self, run_id: &str, shard_id: &str) -> StoreResult<Option<ShardTask>> {
        self.check_available()?;
        let runs = self.runs.read().await;
        Ok(runs
            .get(run_id)
            .and_then(|e| e.shards.get(shard_id))
            .cloned())
    }

    async fn list_shards(
        &self,
        run_id: &str,
        status: Option<ShardStatus>,
    ) -> StoreResult<Vec<ShardTask>> {
        self.check_available()?;
        let runs = self.runs.read().await;
        let Some(entry) = runs.get(run_id) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .shards
            .values()
            .filter(|s| status.map(|st| s.status == st).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_claimable(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ShardTask>> {
        self.check_available()?;
        let runs = self.runs.read().await;
        let Some(entry) = runs.get(run_id) else {
            return Ok(Vec::new());
        };

        let mut candidates: Vec<ShardTask> = entry
            .shards
            .values()
            .filter(|s| s.status == ShardStatus::Unclaimed)
            .take(limit)
            .cloned()
            .collect();

        if candidates.len() < limit {
            let mut expired: Vec<&ShardTask> = entry
                .shards
                .values()
                .filter(|s| s.is_lease_expired(now))
                .collect();
            expired.sort_by(|a, b| {
                a.lease_expires_at
                    .cmp(&b.lease_expires_at)
                    .then_with(|| a.shard_id.cmp(&b.shard_id))
            });
            let room = limit - candidates.len();
            candidates.extend(expired.into_iter().take(room).cloned());
        }

        Ok(candidates)
    }

    async fn update_if(
        &self,
        expected: &[Precondition],
        next: &ShardTask,
    ) -> StoreResult<Option<ShardTask>> {
        self.check_available()?;
        let mut runs = self.runs.write().await;
        let current = runs
            .get_mut(&next.run_id)
            .and_then(|e| e.shards.get_mut(&next.shard_id))
            .ok_or_else(|| StoreError::ShardNotFound {
                run_id: next.run_id.clone(),
                shard_id: next.shard_id.clone(),
            })?;

        if !Precondition::all_hold(expected, current) {
            return Ok(None);
        }

        let mut stored = next.clone();
        stored.version = current.version + 1;
        *current = stored.clone();
        Ok(Some(stored))
    }
}
