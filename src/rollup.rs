//! Rollup pipeline: ingest scored items, then recompute rollups.
//!
//! Every rollup is recomputed from the raw items in its bucket, so a
//! refresh can be repeated any number of times with identical results.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, Weighting};
use crate::clock::{Clock, SystemClock};
use crate::models::{Bucket, BucketKind, ScoredItem, SentimentRollup, TopicKey};
use crate::rollup_store::{BoxedItemStore, BoxedRollupStore, RollupResult};

/// Default trailing window for the current snapshot.
pub const DEFAULT_CURRENT_WINDOW_HOURS: i64 = 24;

/// Most buckets a single view may return.
pub const MAX_HISTORY: usize = 90;

/// An item rejected at ingest.
#[derive(Debug, Clone)]
pub struct RejectedItem {
    pub source_id: String,
    pub reason: String,
}

/// Result of an ingest call.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub received: usize,
    pub inserted: usize,
    pub rejected: Vec<RejectedItem>,
    /// Timestamps of accepted items, used to find buckets to refresh.
    pub touched: Vec<DateTime<Utc>>,
}

/// Result of a refresh.
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub current_keys: usize,
    pub buckets: usize,
    pub rollups_written: usize,
}

/// Ingests items and keeps the current snapshot and historical rollups up to date.
#[derive(Clone)]
pub struct RollupPipeline {
    items: BoxedItemStore,
    rollups: BoxedRollupStore,
    weighting: Arc<dyn Weighting>,
    current_window_hours: i64,
    clock: Arc<dyn Clock>,
}

impl RollupPipeline {
    pub fn new(items: BoxedItemStore, rollups: BoxedRollupStore, weighting: Arc<dyn Weighting>) -> Self {
        Self {
            items,
            rollups,
            weighting,
            current_window_hours: DEFAULT_CURRENT_WINDOW_HOURS,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_current_window(mut self, hours: i64) -> Self {
        self.current_window_hours = hours.max(1);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate and store items. Invalid items are rejected, not fatal.
    pub async fn ingest(&self, items: Vec<ScoredItem>) -> RollupResult<IngestReport> {
        let mut report = IngestReport {
            received: items.len(),
            ..Default::default()
        };

        let mut valid = Vec::with_capacity(items.len());
        for item in items {
            match item.validate() {
                Ok(()) => valid.push(item),
                Err(e) => {
                    warn!(source_id = %item.source_id, "Rejected scored item: {}", e);
                    report.rejected.push(RejectedItem {
                        source_id: item.source_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.touched = valid.iter().map(|i| i.timestamp).collect();
        report.inserted = self.items.upsert_items(&valid).await?;
        info!(
            received = report.received,
            inserted = report.inserted,
            rejected = report.rejected.len(),
            "Ingested scored items"
        );
        Ok(report)
    }

    /// Replace the current snapshot and recompute the historical buckets
    /// containing any of `touched` or now.
    pub async fn refresh(&self, touched: &[DateTime<Utc>]) -> RollupResult<RefreshReport> {
        let now = self.clock.now();
        let mut report = RefreshReport::default();

        let window = Bucket::current(now, self.current_window_hours);
        let snapshot = self.compute(&window, now).await?;
        report.current_keys = snapshot.len();
        self.rollups.replace_current(&snapshot).await?;

        let mut buckets: BTreeSet<Bucket> = BTreeSet::new();
        for kind in BucketKind::HISTORICAL {
            for ts in touched.iter().copied().chain(std::iter::once(now)) {
                if let Some(bucket) = Bucket::containing(kind, ts) {
                    buckets.insert(bucket);
                }
            }
        }

        for bucket in &buckets {
            let rollups = self.compute(bucket, now).await?;
            debug!(
                kind = bucket.kind.as_str(),
                start = %bucket.start,
                keys = rollups.len(),
                "Recomputed bucket"
            );
            report.rollups_written += rollups.len();
            self.rollups.upsert_rollups(&rollups).await?;
        }
        report.buckets = buckets.len();

        info!(
            current_keys = report.current_keys,
            buckets = report.buckets,
            rollups = report.rollups_written,
            "Refreshed rollups"
        );
        Ok(report)
    }

    /// Ingest then refresh the affected buckets.
    pub async fn ingest_and_refresh(
        &self,
        items: Vec<ScoredItem>,
    ) -> RollupResult<(IngestReport, RefreshReport)> {
        let ingest = self.ingest(items).await?;
        let refresh = self.refresh(&ingest.touched).await?;
        Ok((ingest, refresh))
    }

    async fn compute(&self, bucket: &Bucket, now: DateTime<Utc>) -> RollupResult<Vec<SentimentRollup>> {
        let items = self.items.items_in_range(bucket.start, bucket.end).await?;
        Ok(aggregate(&items, bucket, self.weighting.as_ref())
            .into_values()
            .map(|r| r.stamped(now))
            .collect())
    }

    /// Rollups for `key` to serve: the current snapshot, or the `history`
    /// most recent buckets of a calendar kind, newest first. Windows with
    /// no stored rollup come back as empty rollups.
    pub async fn view(
        &self,
        kind: BucketKind,
        key: &TopicKey,
        history: usize,
    ) -> RollupResult<Vec<SentimentRollup>> {
        let now = self.clock.now();
        if kind == BucketKind::Current {
            let rollup = self.rollups.get_current(key).await?.unwrap_or_else(|| {
                SentimentRollup::empty(Bucket::current(now, self.current_window_hours), key.clone())
            });
            return Ok(vec![rollup]);
        }

        let mut out = Vec::new();
        for bucket in Bucket::history(kind, now, history.clamp(1, MAX_HISTORY)) {
            let rollup = self
                .rollups
                .get_rollup(kind, bucket.start, key)
                .await?
                .unwrap_or_else(|| SentimentRollup::empty(bucket, key.clone()));
            out.push(rollup);
        }
        Ok(out)
    }
}
