//! Time-bucketed sentiment aggregates.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Emotion;

/// Window type of a rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketKind {
    /// Trailing window ending at computation time.
    Current,
    Day,
    Week,
    Month,
}

impl BucketKind {
    pub const HISTORICAL: [BucketKind; 3] = [BucketKind::Day, BucketKind::Week, BucketKind::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "current" => Some(Self::Current),
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            _ => None,
        }
    }
}

/// A half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bucket {
    pub kind: BucketKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Bucket {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// `subreddit/topic` grouping key. `all/all` is the global key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicKey {
    pub subreddit: String,
    pub topic: String,
}

impl TopicKey {
    pub const ALL: &'static str = "all";

    pub fn new(subreddit: &str, topic: &str) -> Self {
        Self {
            subreddit: subreddit.trim().to_lowercase(),
            topic: topic.trim().to_lowercase(),
        }
    }

    pub fn global() -> Self {
        Self::new(Self::ALL, Self::ALL)
    }

    pub fn is_global(&self) -> bool {
        self.subreddit == Self::ALL && self.topic == Self::ALL
    }

    /// Parse `subreddit/topic`.
    pub fn parse(s: &str) -> Option<Self> {
        let (subreddit, topic) = s.split_once('/')?;
        if subreddit.is_empty() || topic.is_empty() {
            return None;
        }
        Some(Self::new(subreddit, topic))
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subreddit, self.topic)
    }
}

/// Weighted statistics for one emotion in one group.
///
/// `weighted_sum` and `total_weight` are kept so rollups merge exactly;
/// `mean` is `None` when no positive weight contributed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EmotionStat {
    pub weighted_sum: f64,
    pub total_weight: f64,
    pub mean: Option<f64>,
}

impl EmotionStat {
    pub fn from_totals(weighted_sum: f64, total_weight: f64) -> Self {
        let mean = if total_weight > 0.0 {
            Some(weighted_sum / total_weight)
        } else {
            None
        };
        Self {
            weighted_sum,
            total_weight,
            mean,
        }
    }
}

/// An item that pulled an emotion's mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub source_id: String,
    /// `weight * score` for this item.
    pub contribution: f64,
}

/// Weighted aggregate of one topic key over one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentRollup {
    pub bucket: Bucket,
    pub key: TopicKey,
    pub item_count: u64,
    pub emotions: BTreeMap<Emotion, EmotionStat>,
    #[serde(default)]
    pub top_contributors: BTreeMap<Emotion, Vec<Contributor>>,
    /// Stamped when persisted; aggregation itself leaves it unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_at: Option<DateTime<Utc>>,
}

impl SentimentRollup {
    /// Rollup for a bucket with no contributing items: every mean is null.
    pub fn empty(bucket: Bucket, key: TopicKey) -> Self {
        Self {
            bucket,
            key,
            item_count: 0,
            emotions: Emotion::ALL
                .iter()
                .map(|e| (*e, EmotionStat::default()))
                .collect(),
            top_contributors: BTreeMap::new(),
            computed_at: None,
        }
    }

    pub fn mean(&self, emotion: Emotion) -> Option<f64> {
        self.emotions.get(&emotion).and_then(|s| s.mean)
    }

    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.computed_at = Some(at);
        self
    }
}
