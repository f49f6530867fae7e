//! Claim protocol scenarios run against every shard store backend.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

use redditmeter::clock::ManualClock;
use redditmeter::lease::{LeaseConfig, LeaseManager};
use redditmeter::models::{RunConfig, RunStatus, ShardStatus};
use redditmeter::shard_store::{BoxedShardStore, InMemoryShardStore, SqliteShardStore};

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
    ))
}

fn manager(store: BoxedShardStore, clock: Arc<ManualClock>) -> LeaseManager {
    LeaseManager::with_clock(store, LeaseConfig::default(), clock)
}

fn run_config(total_records: u64, shard_size: u64) -> RunConfig {
    RunConfig {
        model_id: "emotion-test".to_string(),
        source_dataset: "posts.jsonl".to_string(),
        revision: None,
        shard_size,
        total_records,
    }
}

fn memory_store() -> (Option<TempDir>, BoxedShardStore) {
    (None, Arc::new(InMemoryShardStore::new()))
}

async fn sqlite_store() -> (Option<TempDir>, BoxedShardStore) {
    let dir = TempDir::new().unwrap();
    let store = SqliteShardStore::new(&dir.path().join("shards.db"))
        .await
        .unwrap();
    (Some(dir), Arc::new(store))
}

async fn concurrent_claims_have_one_winner(store: BoxedShardStore) {
    let leases = manager(store, clock());
    leases.create_run("run", run_config(10, 10)).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let leases = leases.clone();
            tokio::spawn(async move {
                leases
                    .claim_shard("run", &format!("worker-{}", i), 30)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap() {
            winners.push(task);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].attempt_count, 1);

    let stored = leases
        .store()
        .get_shard("run", &winners[0].shard_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.owner, winners[0].owner);
}

async fn two_workers_split_three_shards(store: BoxedShardStore) {
    let leases = manager(store, clock());
    leases.create_run("run", run_config(6, 2)).await.unwrap();

    let mut claims: HashMap<String, usize> = HashMap::new();
    let a = leases.claim_shard("run", "a", 30).await.unwrap().unwrap();
    let b = leases.claim_shard("run", "b", 30).await.unwrap().unwrap();
    assert_ne!(a.shard_id, b.shard_id);
    *claims.entry(a.shard_id.clone()).or_default() += 1;
    *claims.entry(b.shard_id.clone()).or_default() += 1;

    assert!(leases.complete_shard("run", &a.shard_id, "a").await.unwrap());
    assert!(leases.complete_shard("run", &b.shard_id, "b").await.unwrap());

    let c = leases.claim_shard("run", "a", 30).await.unwrap().unwrap();
    *claims.entry(c.shard_id.clone()).or_default() += 1;
    assert!(leases.claim_shard("run", "b", 30).await.unwrap().is_none());
    assert!(leases.complete_shard("run", &c.shard_id, "a").await.unwrap());

    assert_eq!(claims.len(), 3);
    assert!(claims.values().all(|n| *n == 1));

    let progress = leases.run_status("run").await.unwrap();
    assert_eq!(progress.complete, 3);
    assert!(progress.is_drained());
    assert!(leases.finalize_run("run").await.unwrap());
    assert_eq!(leases.run_state("run").await.unwrap(), RunStatus::Complete);
}

async fn expired_lease_is_reclaimed_and_late_completion_refused(store: BoxedShardStore) {
    let clock = clock();
    let leases = manager(store, clock.clone());
    leases.create_run("run", run_config(5, 5)).await.unwrap();

    let first = leases.claim_shard("run", "a", 1).await.unwrap().unwrap();
    clock.advance(Duration::minutes(2));

    let second = leases.claim_shard("run", "b", 1).await.unwrap().unwrap();
    assert_eq!(second.shard_id, first.shard_id);
    assert_eq!(second.attempt_count, 2);
    assert_eq!(second.owner.as_deref(), Some("b"));

    let before = leases
        .store()
        .get_shard("run", &first.shard_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!leases.complete_shard("run", &first.shard_id, "a").await.unwrap());
    let after = leases
        .store()
        .get_shard("run", &first.shard_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before, after);
    assert_eq!(after.status, ShardStatus::Claimed);

    assert!(leases.complete_shard("run", &first.shard_id, "b").await.unwrap());
    let done = leases
        .store()
        .get_shard("run", &first.shard_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, ShardStatus::Complete);
    assert_eq!(done.completed_attempt, Some(2));
}

async fn live_lease_blocks_other_workers(store: BoxedShardStore) {
    let clock = clock();
    let leases = manager(store, clock.clone());
    leases.create_run("run", run_config(5, 5)).await.unwrap();

    leases.claim_shard("run", "a", 10).await.unwrap().unwrap();
    clock.advance(Duration::minutes(9));
    assert!(leases.claim_shard("run", "b", 10).await.unwrap().is_none());
}

async fn repeated_failures_end_in_failed(store: BoxedShardStore) {
    let leases = manager(store, clock());
    leases.create_run("run", run_config(3, 3)).await.unwrap();

    // Claims and failures both count: claim 1, fail 2, claim 3, fail 4.
    for attempt in [1, 3] {
        let task = leases.claim_shard("run", "a", 30).await.unwrap().unwrap();
        assert_eq!(task.attempt_count, attempt);
        assert!(leases
            .fail_shard("run", &task.shard_id, "a", "model crashed")
            .await
            .unwrap());
    }

    assert!(leases.claim_shard("run", "a", 30).await.unwrap().is_none());
    let progress = leases.run_status("run").await.unwrap();
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.failures[0].attempts, 4);
    assert_eq!(progress.failures[0].reason.as_deref(), Some("model crashed"));
}

async fn exhausted_expired_claim_is_failed_on_scan(store: BoxedShardStore) {
    let clock = clock();
    let leases = manager(store, clock.clone());
    leases.create_run("run", run_config(3, 3)).await.unwrap();

    for _ in 0..3 {
        leases.claim_shard("run", "a", 1).await.unwrap().unwrap();
        clock.advance(Duration::minutes(2));
    }

    assert!(leases.claim_shard("run", "b", 1).await.unwrap().is_none());
    let progress = leases.run_status("run").await.unwrap();
    assert_eq!(progress.failed, 1);
    assert!(progress.is_drained());
}

async fn non_owner_cannot_fail_or_renew(store: BoxedShardStore) {
    let leases = manager(store, clock());
    leases.create_run("run", run_config(3, 3)).await.unwrap();

    let task = leases.claim_shard("run", "a", 30).await.unwrap().unwrap();
    assert!(!leases
        .fail_shard("run", &task.shard_id, "b", "not mine")
        .await
        .unwrap());
    assert!(!leases.renew_lease("run", &task.shard_id, "b", 30).await.unwrap());
    assert!(leases.renew_lease("run", &task.shard_id, "a", 30).await.unwrap());

    let stored = leases
        .store()
        .get_shard("run", &task.shard_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.owner.as_deref(), Some("a"));
    assert_eq!(stored.attempt_count, 1);
}

async fn cancelled_run_hands_out_nothing(store: BoxedShardStore) {
    let leases = manager(store, clock());
    leases.create_run("run", run_config(4, 2)).await.unwrap();
    assert!(leases.cancel_run("run").await.unwrap());

    assert!(leases.claim_shard("run", "a", 30).await.unwrap().is_none());
    assert_eq!(leases.run_state("run").await.unwrap(), RunStatus::Cancelled);
    assert!(!leases.finalize_run("run").await.unwrap());
    assert!(!leases.cancel_run("run").await.unwrap());
}

async fn finished_run_cannot_be_cancelled(store: BoxedShardStore) {
    let leases = manager(store, clock());
    leases.create_run("run", run_config(2, 2)).await.unwrap();
    let task = leases.claim_shard("run", "a", 30).await.unwrap().unwrap();
    assert!(leases.complete_shard("run", &task.shard_id, "a").await.unwrap());
    assert!(leases.finalize_run("run").await.unwrap());

    assert!(!leases.cancel_run("run").await.unwrap());
    assert_eq!(leases.run_state("run").await.unwrap(), RunStatus::Complete);
}

macro_rules! protocol_tests {
    ($($name:ident),* $(,)?) => {
        mod in_memory {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $name() {
                    let (_dir, store) = super::memory_store();
                    super::$name(store).await;
                }
            )*
        }

        mod sqlite {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $name() {
                    let (_dir, store) = super::sqlite_store().await;
                    super::$name(store).await;
                }
            )*
        }
    };
}

protocol_tests!(
    concurrent_claims_have_one_winner,
    two_workers_split_three_shards,
    expired_lease_is_reclaimed_and_late_completion_refused,
    live_lease_blocks_other_workers,
    repeated_failures_end_in_failed,
    exhausted_expired_claim_is_failed_on_scan,
    non_owner_cannot_fail_or_renew,
    cancelled_run_hands_out_nothing,
    finished_run_cannot_be_cancelled,
);
