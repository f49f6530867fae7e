//! In-memory item and rollup store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::backend::{ItemStore, RollupError, RollupResult, RollupStore};
use crate::models::{BucketKind, ScoredItem, SentimentRollup, TopicKey};

type RollupKey = (BucketKind, DateTime<Utc>, TopicKey);

#[derive(Default)]
struct Inner {
    items: BTreeMap<String, ScoredItem>,
    current: BTreeMap<TopicKey, SentimentRollup>,
    rollups: BTreeMap<RollupKey, SentimentRollup>,
}

/// Item and rollup store held in process memory.
#[derive(Clone, Default)]
pub struct InMemoryRollupStore {
    inner: Arc<RwLock<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryRollupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> RollupResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RollupError::Unavailable(
                "in-memory store offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ItemStore for InMemoryRollupStore {
    async fn upsert_items(&self, items: &[ScoredItem]) -> RollupResult<usize> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for item in items {
            if !inner.items.contains_key(&item.source_id) {
                inner.items.insert(item.source_id.clone(), item.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn items_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RollupResult<Vec<ScoredItem>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .items
            .values()
            .filter(|i| i.timestamp >= start && i.timestamp < end)
            .cloned()
            .collect())
    }

    async fn item_count(&self) -> RollupResult<u64> {
        self.check_available()?;
        Ok(self.inner.read().await.items.len() as u64)
    }
}

#[async_trait]
impl RollupStore for InMemoryRollupStore {
    async fn replace_current(&self, rollups: &[SentimentRollup]) -> RollupResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        inner.current = rollups
            .iter()
            .map(|r| (r.key.clone(), r.clone()))
            .collect();
        Ok(())
    }

    async fn upsert_rollups(&self, rollups: &[SentimentRollup]) -> RollupResult<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        for rollup in rollups {
            inner.rollups.insert(
                (rollup.bucket.kind, rollup.bucket.start, rollup.key.clone()),
                rollup.clone(),
            );
        }
        Ok(())
    }

    async fn get_current(&self, key: &TopicKey) -> RollupResult<Option<SentimentRollup>> {
        self.check_available()?;
        Ok(self.inner.read().await.current.get(key).cloned())
    }

    async fn get_rollup(
        &self,
        kind: BucketKind,
        start: DateTime<Utc>,
        key: &TopicKey,
    ) -> RollupResult<Option<SentimentRollup>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner.rollups.get(&(kind, start, key.clone())).cloned())
    }

    async fn list_rollups(
        &self,
        kind: BucketKind,
        key: &TopicKey,
        before: DateTime<Utc>,
        limit: usize,
    ) -> RollupResult<Vec<SentimentRollup>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        let mut found: Vec<SentimentRollup> = inner
            .rollups
            .values()
            .filter(|r| r.bucket.kind == kind && &r.key == key && r.bucket.start < before)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.bucket.start.cmp(&a.bucket.start));
        found.truncate(limit);
        Ok(found)
    }
}
