//! SQLite-backed item and rollup store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::backend::{ItemStore, RollupError, RollupResult, RollupStore};
use crate::models::{BucketKind, ScoredItem, SentimentRollup, TopicKey};
use crate::repository::{format_datetime, with_connection};

/// Item and rollup store persisted in a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteRollupStore {
    db_path: PathBuf,
}

impl SqliteRollupStore {
    /// Open the store, creating tables if needed.
    pub async fn new(db_path: &Path) -> RollupResult<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> RollupResult<()> {
        with_connection(&self.db_path, |conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS scored_items (
                    source_id TEXT PRIMARY KEY,
                    subreddit TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    ingested_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                );

                CREATE INDEX IF NOT EXISTS idx_scored_items_timestamp
                    ON scored_items(timestamp);

                CREATE TABLE IF NOT EXISTS sentiment_rollups (
                    bucket_kind TEXT NOT NULL,
                    bucket_start TEXT NOT NULL,
                    subreddit TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    bucket_end TEXT NOT NULL,
                    item_count INTEGER NOT NULL,
                    computed_at TEXT,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (bucket_kind, bucket_start, subreddit, topic)
                );

                CREATE INDEX IF NOT EXISTS idx_sentiment_rollups_key
                    ON sentiment_rollups(bucket_kind, subreddit, topic, bucket_start);
            "#,
            )?;
            Ok(())
        })
        .await
    }

    async fn run<T, F>(&self, f: F) -> RollupResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> RollupResult<T> + Send + 'static,
    {
        with_connection(&self.db_path, f).await
    }
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, payload: &str) -> RollupResult<T> {
    serde_json::from_str(payload).map_err(|e| RollupError::Malformed {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn insert_rollup(conn: &Connection, rollup: &SentimentRollup) -> RollupResult<()> {
    let payload = serde_json::to_string(rollup)?;
    conn.execute(
        "INSERT INTO sentiment_rollups \
         (bucket_kind, bucket_start, subreddit, topic, bucket_end, item_count, computed_at, payload) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT(bucket_kind, bucket_start, subreddit, topic) DO UPDATE SET \
         bucket_end = excluded.bucket_end, item_count = excluded.item_count, \
         computed_at = excluded.computed_at, payload = excluded.payload",
        params![
            rollup.bucket.kind.as_str(),
            format_datetime(&rollup.bucket.start),
            rollup.key.subreddit,
            rollup.key.topic,
            format_datetime(&rollup.bucket.end),
            rollup.item_count as i64,
            rollup.computed_at.as_ref().map(format_datetime),
            payload,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl ItemStore for SqliteRollupStore {
    async fn upsert_items(&self, items: &[ScoredItem]) -> RollupResult<usize> {
        let items = items.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO scored_items \
                     (source_id, subreddit, topic, timestamp, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for item in &items {
                    let payload = serde_json::to_string(item)?;
                    inserted += stmt.execute(params![
                        item.source_id,
                        item.subreddit,
                        item.topic,
                        format_datetime(&item.timestamp),
                        payload,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn items_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RollupResult<Vec<ScoredItem>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT source_id, payload FROM scored_items \
                 WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY timestamp, source_id",
            )?;
            let rows = stmt
                .query_map(
                    params![format_datetime(&start), format_datetime(&end)],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|(id, payload)| decode::<ScoredItem>(id, payload))
                .collect()
        })
        .await
    }

    async fn item_count(&self) -> RollupResult<u64> {
        self.run(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM scored_items", [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
    }
}

#[async_trait]
impl RollupStore for SqliteRollupStore {
    async fn replace_current(&self, rollups: &[SentimentRollup]) -> RollupResult<()> {
        let rollups = rollups.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM sentiment_rollups WHERE bucket_kind = ?1",
                params![BucketKind::Current.as_str()],
            )?;
            for rollup in &rollups {
                insert_rollup(&tx, rollup)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn upsert_rollups(&self, rollups: &[SentimentRollup]) -> RollupResult<()> {
        let rollups = rollups.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for rollup in &rollups {
                insert_rollup(&tx, rollup)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_current(&self, key: &TopicKey) -> RollupResult<Option<SentimentRollup>> {
        let key = key.clone();
        self.run(move |conn| {
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM sentiment_rollups \
                     WHERE bucket_kind = ?1 AND subreddit = ?2 AND topic = ?3 \
                     ORDER BY bucket_start DESC LIMIT 1",
                    params![BucketKind::Current.as_str(), key.subreddit, key.topic],
                    |row| row.get(0),
                )
                .optional()?;
            payload
                .map(|p| decode(&format!("current/{}", key), &p))
                .transpose()
        })
        .await
    }

    async fn get_rollup(
        &self,
        kind: BucketKind,
        start: DateTime<Utc>,
        key: &TopicKey,
    ) -> RollupResult<Option<SentimentRollup>> {
        let key = key.clone();
        self.run(move |conn| {
            let start = format_datetime(&start);
            let payload: Option<String> = conn
                .query_row(
                    "SELECT payload FROM sentiment_rollups \
                     WHERE bucket_kind = ?1 AND bucket_start = ?2 AND subreddit = ?3 AND topic = ?4",
                    params![kind.as_str(), start, key.subreddit, key.topic],
                    |row| row.get(0),
                )
                .optional()?;
            payload
                .map(|p| decode(&format!("{}/{}/{}", kind.as_str(), start, key), &p))
                .transpose()
        })
        .await
    }

    async fn list_rollups(
        &self,
        kind: BucketKind,
        key: &TopicKey,
        before: DateTime<Utc>,
        limit: usize,
    ) -> RollupResult<Vec<SentimentRollup>> {
        let key = key.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT bucket_start, payload FROM sentiment_rollups \
                 WHERE bucket_kind = ?1 AND subreddit = ?2 AND topic = ?3 AND bucket_start < ?4 \
                 ORDER BY bucket_start DESC LIMIT ?5",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        kind.as_str(),
                        key.subreddit,
                        key.topic,
                        format_datetime(&before),
                        limit as i64
                    ],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|(start, payload)| decode(&format!("{}/{}/{}", kind.as_str(), start, key), payload))
                .collect()
        })
        .await
    }
}
