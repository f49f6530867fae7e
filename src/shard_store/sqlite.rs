//! SQLite-backed shard store.
//!
//! Multiple worker processes may point at the same database file. Conditional
//! writes run as a single `UPDATE ... WHERE <preconditions>` inside an
//! immediate transaction, so exactly one concurrent writer observes a
//! matching row.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use super::backend::{Precondition, ShardStore, StoreError, StoreResult};
use crate::models::{AnnotationRun, RunConfig, RunStatus, ShardStatus, ShardTask};
use crate::repository::{format_datetime, parse_datetime, with_connection};

const SHARD_COLUMNS: &str = "run_id, shard_id, start_idx, end_idx, status, owner, \
     lease_expires_at, attempt_count, completed_attempt, last_error, version, updated_at";

/// Shard store persisted in a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteShardStore {
    db_path: PathBuf,
}

impl SqliteShardStore {
    /// Open the store, creating tables if needed.
    pub async fn new(db_path: &Path) -> StoreResult<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        with_connection(&self.db_path, |conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS annotation_runs (
                    run_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL DEFAULT 'active',
                    created_at TEXT NOT NULL,
                    config TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS shard_tasks (
                    run_id TEXT NOT NULL REFERENCES annotation_runs(run_id),
                    shard_id TEXT NOT NULL,
                    start_idx INTEGER NOT NULL,
                    end_idx INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'unclaimed',
                    owner TEXT,
                    lease_expires_at TEXT,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    completed_attempt INTEGER,
                    last_error TEXT,
                    version INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (run_id, shard_id)
                );

                CREATE INDEX IF NOT EXISTS idx_shard_tasks_status
                    ON shard_tasks(run_id, status, shard_id);
                CREATE INDEX IF NOT EXISTS idx_shard_tasks_lease
                    ON shard_tasks(run_id, lease_expires_at) WHERE status = 'claimed';
            "#,
            )?;
            Ok(())
        })
        .await
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        with_connection(&self.db_path, f).await
    }
}

/// Raw column values, converted to a validated [`ShardTask`] afterwards.
struct ShardRow {
    run_id: String,
    shard_id: String,
    start_idx: i64,
    end_idx: i64,
    status: String,
    owner: Option<String>,
    lease_expires_at: Option<String>,
    attempt_count: i64,
    completed_attempt: Option<i64>,
    last_error: Option<String>,
    version: i64,
    updated_at: String,
}

fn row_to_shard(row: &rusqlite::Row) -> rusqlite::Result<ShardRow> {
    Ok(ShardRow {
        run_id: row.get(0)?,
        shard_id: row.get(1)?,
        start_idx: row.get(2)?,
        end_idx: row.get(3)?,
        status: row.get(4)?,
        owner: row.get(5)?,
        lease_expires_at: row.get(6)?,
        attempt_count: row.get(7)?,
        completed_attempt: row.get(8)?,
        last_error: row.get(9)?,
        version: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

impl ShardRow {
    fn into_task(self) -> StoreResult<ShardTask> {
        let key = format!("{}/{}", self.run_id, self.shard_id);
        let malformed = |reason: String| StoreError::Malformed {
            key: key.clone(),
            reason,
        };

        let status = ShardStatus::from_str(&self.status)
            .ok_or_else(|| malformed(format!("unknown status '{}'", self.status)))?;
        let lease_expires_at = match self.lease_expires_at {
            Some(s) => Some(
                parse_datetime(&s).ok_or_else(|| malformed(format!("bad lease expiry '{}'", s)))?,
            ),
            None => None,
        };
        let updated_at = parse_datetime(&self.updated_at)
            .ok_or_else(|| malformed(format!("bad updated_at '{}'", self.updated_at)))?;
        if self.start_idx < 0 || self.end_idx < self.start_idx {
            return Err(malformed(format!(
                "bad range {}..={}",
                self.start_idx, self.end_idx
            )));
        }
        if status == ShardStatus::Claimed && self.owner.is_none() {
            return Err(malformed("claimed shard without owner".to_string()));
        }

        Ok(ShardTask {
            run_id: self.run_id,
            shard_id: self.shard_id,
            start_idx: self.start_idx as u64,
            end_idx: self.end_idx as u64,
            status,
            owner: self.owner,
            lease_expires_at,
            attempt_count: self.attempt_count.max(0) as u32,
            completed_attempt: self.completed_attempt.map(|a| a.max(0) as u32),
            last_error: self.last_error,
            version: self.version.max(0) as u64,
            updated_at,
        })
    }
}

fn fetch_shard(conn: &Connection, run_id: &str, shard_id: &str) -> StoreResult<Option<ShardTask>> {
    let sql = format!(
        "SELECT {} FROM shard_tasks WHERE run_id = ?1 AND shard_id = ?2",
        SHARD_COLUMNS
    );
    let row = conn
        .query_row(&sql, params![run_id, shard_id], row_to_shard)
        .optional()?;
    row.map(ShardRow::into_task).transpose()
}

fn query_shards(conn: &Connection, sql: &str, values: Vec<Value>) -> StoreResult<Vec<ShardTask>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), row_to_shard)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(ShardRow::into_task).collect()
}

fn opt_text(s: &Option<String>) -> Value {
    match s {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

/// Append SQL for each precondition, collecting bound values.
fn precondition_sql(expected: &[Precondition], clauses: &mut Vec<String>, values: &mut Vec<Value>) {
    for pre in expected {
        match pre {
            Precondition::Version(v) => {
                clauses.push("version = ?".to_string());
                values.push(Value::Integer(*v as i64));
            }
            Precondition::Claimable(now) => {
                clauses.push(
                    "(status = 'unclaimed' OR (status = 'claimed' AND \
                     (lease_expires_at IS NULL OR lease_expires_at < ?)))"
                        .to_string(),
                );
                values.push(Value::Text(format_datetime(now)));
            }
            Precondition::OwnedBy(worker) => {
                clauses.push("owner = ?".to_string());
                values.push(Value::Text(worker.clone()));
            }
            Precondition::Status(status) => {
                clauses.push("status = ?".to_string());
                values.push(Value::Text(status.as_str().to_string()));
            }
        }
    }
}

#[async_trait]
impl ShardStore for SqliteShardStore {
    async fn create_run(&self, run: &AnnotationRun, shards: &[ShardTask]) -> StoreResult<()> {
        let run = run.clone();
        let shards = shards.to_vec();
        self.run(move |conn| {
            let config = serde_json::to_string(&run.config)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM annotation_runs WHERE run_id = ?1",
                    params![run.run_id],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if exists {
                return Err(StoreError::RunExists(run.run_id.clone()));
            }

            tx.execute(
                "INSERT INTO annotation_runs (run_id, status, created_at, config) VALUES (?1, ?2, ?3, ?4)",
                params![
                    run.run_id,
                    run.status.as_str(),
                    format_datetime(&run.created_at),
                    config
                ],
            )?;

            {
                let mut stmt = tx.prepare(&format!(
                    "INSERT INTO shard_tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    SHARD_COLUMNS
                ))?;
                for shard in &shards {
                    stmt.execute(params![
                        shard.run_id,
                        shard.shard_id,
                        shard.start_idx as i64,
                        shard.end_idx as i64,
                        shard.status.as_str(),
                        shard.owner,
                        shard.lease_expires_at.as_ref().map(format_datetime),
                        shard.attempt_count as i64,
                        shard.completed_attempt.map(|a| a as i64),
                        shard.last_error,
                        shard.version as i64,
                        format_datetime(&shard.updated_at),
                    ])?;
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> StoreResult<Option<AnnotationRun>> {
        let run_id = run_id.to_string();
        self.run(move |conn| {
            let row: Option<(String, String, String, String)> = conn
                .query_row(
                    "SELECT run_id, status, created_at, config FROM annotation_runs WHERE run_id = ?1",
                    params![run_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let Some((run_id, status, created_at, config)) = row else {
                return Ok(None);
            };
            let malformed = |reason: String| StoreError::Malformed {
                key: run_id.clone(),
                reason,
            };
            let status = RunStatus::from_str(&status)
                .ok_or_else(|| malformed(format!("unknown run status '{}'", status)))?;
            let created_at = parse_datetime(&created_at)
                .ok_or_else(|| malformed(format!("bad created_at '{}'", created_at)))?;
            let config: RunConfig = serde_json::from_str(&config)
                .map_err(|e| malformed(format!("bad config: {}", e)))?;

            Ok(Some(AnnotationRun {
                run_id: run_id.clone(),
                created_at,
                status,
                config,
            }))
        })
        .await
    }

    async fn set_run_status(
        &self,
        run_id: &str,
        expected: RunStatus,
        status: RunStatus,
    ) -> StoreResult<bool> {
        let run_id = run_id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE annotation_runs SET status = ?1 WHERE run_id = ?2 AND status = ?3",
                params![status.as_str(), run_id, expected.as_str()],
            )?;
            if updated > 0 {
                return Ok(true);
            }
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM annotation_runs WHERE run_id = ?1)",
                params![run_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::RunNotFound(run_id));
            }
            Ok(false)
        })
        .await
    }

    async fn get_shard(&self, run_id: &str, shard_id: &str) -> StoreResult<Option<ShardTask>> {
        let (run_id, shard_id) = (run_id.to_string(), shard_id.to_string());
        self.run(move |conn| fetch_shard(conn, &run_id, &shard_id))
            .await
    }

    async fn list_shards(
        &self,
        run_id: &str,
        status: Option<ShardStatus>,
    ) -> StoreResult<Vec<ShardTask>> {
        let run_id = run_id.to_string();
        self.run(move |conn| match status {
            Some(status) => query_shards(
                conn,
                &format!(
                    "SELECT {} FROM shard_tasks WHERE run_id = ? AND status = ? ORDER BY shard_id",
                    SHARD_COLUMNS
                ),
                vec![Value::Text(run_id), Value::Text(status.as_str().to_string())],
            ),
            None => query_shards(
                conn,
                &format!(
                    "SELECT {} FROM shard_tasks WHERE run_id = ? ORDER BY shard_id",
                    SHARD_COLUMNS
                ),
                vec![Value::Text(run_id)],
            ),
        })
        .await
    }

    async fn list_claimable(
        &self,
        run_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ShardTask>> {
        let run_id = run_id.to_string();
        self.run(move |conn| {
            let mut shards = query_shards(
                conn,
                &format!(
                    "SELECT {} FROM shard_tasks WHERE run_id = ? AND status = 'unclaimed' \
                     ORDER BY shard_id LIMIT ?",
                    SHARD_COLUMNS
                ),
                vec![Value::Text(run_id.clone()), Value::Integer(limit as i64)],
            )?;

            if shards.len() < limit {
                let room = limit - shards.len();
                shards.extend(query_shards(
                    conn,
                    &format!(
                        "SELECT {} FROM shard_tasks WHERE run_id = ? AND status = 'claimed' \
                         AND (lease_expires_at IS NULL OR lease_expires_at < ?) \
                         ORDER BY lease_expires_at, shard_id LIMIT ?",
                        SHARD_COLUMNS
                    ),
                    vec![
                        Value::Text(run_id),
                        Value::Text(format_datetime(&now)),
                        Value::Integer(room as i64),
                    ],
                )?);
            }

            Ok(shards)
        })
        .await
    }

    async fn update_if(
        &self,
        expected: &[Precondition],
        next: &ShardTask,
    ) -> StoreResult<Option<ShardTask>> {
        let expected = expected.to_vec();
        let next = next.clone();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let mut values = vec![
                Value::Integer(next.start_idx as i64),
                Value::Integer(next.end_idx as i64),
                Value::Text(next.status.as_str().to_string()),
                opt_text(&next.owner),
                opt_text(&next.lease_expires_at.as_ref().map(format_datetime)),
                Value::Integer(next.attempt_count as i64),
                next.completed_attempt
                    .map(|a| Value::Integer(a as i64))
                    .unwrap_or(Value::Null),
                opt_text(&next.last_error),
                Value::Text(format_datetime(&next.updated_at)),
                Value::Text(next.run_id.clone()),
                Value::Text(next.shard_id.clone()),
            ];
            let mut clauses = vec!["run_id = ?".to_string(), "shard_id = ?".to_string()];
            precondition_sql(&expected, &mut clauses, &mut values);

            let sql = format!(
                "UPDATE shard_tasks SET start_idx = ?, end_idx = ?, status = ?, owner = ?, \
                 lease_expires_at = ?, attempt_count = ?, completed_attempt = ?, last_error = ?, \
                 updated_at = ?, version = version + 1 WHERE {}",
                clauses.join(" AND ")
            );
            let updated = tx.execute(&sql, params_from_iter(values))?;

            let stored = fetch_shard(&tx, &next.run_id, &next.shard_id)?;
            tx.commit()?;

            match (updated, stored) {
                (0, Some(_)) => Ok(None),
                (_, Some(task)) => Ok(Some(task)),
                (_, None) => Err(StoreError::ShardNotFound {
                    run_id: next.run_id.clone(),
                    shard_id: next.shard_id.clone(),
                }),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    async fn store_with_run(dir: &tempfile::TempDir) -> SqliteShardStore {
        let store = SqliteShardStore::new(&dir.path().join("shards.db"))
            .await
            .unwrap();
        let run = AnnotationRun::new(
            "run-1",
            RunConfig {
                model_id: "m".to_string(),
                source_dataset: "posts.jsonl".to_string(),
                revision: None,
                shard_size: 10,
                total_records: 20,
            },
            t0(),
        );
        let shards = vec![
            ShardTask::new("run-1", "shard-000001", 0, 9, t0()),
            ShardTask::new("run-1", "shard-000002", 10, 19, t0()),
        ];
        store.create_run(&run, &shards).await.unwrap();
        store
    }

    #[tokio::test]
    async fn run_status_changes_only_from_expected_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_run(&dir).await;

        assert!(store
            .set_run_status("run-1", RunStatus::Active, RunStatus::Cancelled)
            .await
            .unwrap());
        assert!(!store
            .set_run_status("run-1", RunStatus::Active, RunStatus::Complete)
            .await
            .unwrap());
        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);

        let err = store
            .set_run_status("missing", RunStatus::Active, RunStatus::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn run_round_trips_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_run(&dir).await;

        let run = store.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.config.total_records, 20);
        assert_eq!(run.created_at, t0());

        let shards = store.list_shards("run-1", None).await.unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[1].start_idx, 10);
    }

    #[tokio::test]
    async fn duplicate_run_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_run(&dir).await;
        let run = store.get_run("run-1").await.unwrap().unwrap();
        let err = store.create_run(&run, &[]).await.unwrap_err();
        assert!(matches!(err, StoreError::RunExists(_)));
    }

    #[tokio::test]
    async fn stale_version_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_run(&dir).await;
        let shard = store.get_shard("run-1", "shard-000001").await.unwrap().unwrap();

        let claimed = shard.claimed_by("w1", t0(), chrono::Duration::minutes(5));
        let stored = store
            .update_if(&[Precondition::Version(shard.version)], &claimed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.owner.as_deref(), Some("w1"));

        let rival = shard.claimed_by("w2", t0(), chrono::Duration::minutes(5));
        let lost = store
            .update_if(&[Precondition::Version(shard.version)], &rival)
            .await
            .unwrap();
        assert!(lost.is_none());
    }

    #[tokio::test]
    async fn malformed_row_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_run(&dir).await;
        let path = dir.path().join("shards.db");
        crate::repository::connect(&path)
            .unwrap()
            .execute(
                "UPDATE shard_tasks SET status = 'exploded' WHERE shard_id = 'shard-000002'",
                [],
            )
            .unwrap();

        let err = store.get_shard("run-1", "shard-000002").await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[tokio::test]
    async fn expired_claims_listed_after_unclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_run(&dir).await;
        let shard = store.get_shard("run-1", "shard-000001").await.unwrap().unwrap();
        store
            .update_if(
                &[Precondition::Version(0)],
                &shard.claimed_by("w1", t0(), chrono::Duration::minutes(1)),
            )
            .await
            .unwrap()
            .unwrap();

        let now = t0() + chrono::Duration::seconds(30);
        let ids: Vec<_> = store
            .list_claimable("run-1", now, 25)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.shard_id)
            .collect();
        assert_eq!(ids, vec!["shard-000002"]);

        let later = t0() + chrono::Duration::minutes(2);
        let ids: Vec<_> = store
            .list_claimable("run-1", later, 25)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.shard_id)
            .collect();
        assert_eq!(ids, vec!["shard-000002", "shard-000001"]);
    }
}
