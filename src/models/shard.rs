//! Shard task model.
//!
//! A shard is a contiguous, inclusive slice of a run's input dataset and the
//! unit that workers claim. All transitions go through conditional writes in
//! the shard store; the helpers here only build the next document state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Claim state of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Unclaimed,
    Claimed,
    Complete,
    Failed,
}

impl ShardStatus {
    pub const ALL: [ShardStatus; 4] = [
        ShardStatus::Unclaimed,
        ShardStatus::Claimed,
        ShardStatus::Complete,
        ShardStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unclaimed => "unclaimed",
            Self::Claimed => "claimed",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unclaimed" => Some(Self::Unclaimed),
            "claimed" => Some(Self::Claimed),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal shards are never offered to workers again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Shard identifier for the zero-based shard index, `shard-000001` style.
pub fn shard_id_for(index: u64) -> String {
    format!("shard-{:06}", index + 1)
}

/// A claimable unit of work within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardTask {
    pub run_id: String,
    pub shard_id: String,
    /// First record index (inclusive).
    pub start_idx: u64,
    /// Last record index (inclusive).
    pub end_idx: u64,
    pub status: ShardStatus,
    pub owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    /// Attempt whose output counts, set on completion.
    pub completed_attempt: Option<u32>,
    pub last_error: Option<String>,
    /// Bumped by the store on every successful write.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl ShardTask {
    pub fn new(
        run_id: impl Into<String>,
        shard_id: impl Into<String>,
        start_idx: u64,
        end_idx: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            shard_id: shard_id.into(),
            start_idx,
            end_idx,
            status: ShardStatus::Unclaimed,
            owner: None,
            lease_expires_at: None,
            attempt_count: 0,
            completed_attempt: None,
            last_error: None,
            version: 0,
            updated_at: now,
        }
    }

    pub fn record_count(&self) -> u64 {
        self.end_idx - self.start_idx + 1
    }

    /// A claimed shard with no lease or a lease in the past.
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ShardStatus::Claimed
            && self.lease_expires_at.map(|exp| exp < now).unwrap_or(true)
    }

    /// Unclaimed, or claimed with an expired lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == ShardStatus::Unclaimed || self.is_lease_expired(now)
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.owner.as_deref() == Some(worker_id)
    }

    /// Next state after `worker_id` wins a claim.
    pub fn claimed_by(&self, worker_id: &str, now: DateTime<Utc>, lease: Duration) -> Self {
        Self {
            status: ShardStatus::Claimed,
            owner: Some(worker_id.to_string()),
            lease_expires_at: Some(now + lease),
            attempt_count: self.attempt_count + 1,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Next state after the owner finishes the shard.
    pub fn completed(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: ShardStatus::Complete,
            lease_expires_at: None,
            completed_attempt: Some(self.attempt_count),
            last_error: None,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Next state after a failed attempt: the failure counts as an attempt
    /// of its own, then the shard goes back to the pool, or is terminally
    /// failed once the count reaches `max_attempts`.
    pub fn released_after_failure(
        &self,
        reason: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let attempt_count = self.attempt_count + 1;
        let status = if attempt_count >= max_attempts {
            ShardStatus::Failed
        } else {
            ShardStatus::Unclaimed
        };
        Self {
            status,
            owner: None,
            lease_expires_at: None,
            attempt_count,
            last_error: Some(reason.to_string()),
            updated_at: now,
            ..self.clone()
        }
    }
}
