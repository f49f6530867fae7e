//! Annotation run model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a labeling campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Complete,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "complete" => Some(Self::Complete),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Configuration a run was created with. Workers read it to know which
/// model and dataset slice they are labeling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Identifier of the scoring model.
    pub model_id: String,
    /// Source dataset (a JSONL path for the bundled input source).
    pub source_dataset: String,
    /// Dataset revision, when the source is versioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Records per shard.
    pub shard_size: u64,
    /// Total records in the source dataset.
    pub total_records: u64,
}

/// One distributed labeling campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRun {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub config: RunConfig,
}

impl AnnotationRun {
    pub fn new(run_id: impl Into<String>, config: RunConfig, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            created_at: now,
            status: RunStatus::Active,
            config,
        }
    }

    /// Number of shards the run's dataset splits into.
    pub fn shard_count(&self) -> u64 {
        if self.config.shard_size == 0 {
            return 0;
        }
        self.config.total_records.div_ceil(self.config.shard_size)
    }
}
