//! Per-item weighting policies.

use serde::{Deserialize, Serialize};

use crate::models::{Bucket, ScoredItem};

/// Assigns a non-negative weight to an item within a bucket.
pub trait Weighting: Send + Sync {
    fn weight(&self, item: &ScoredItem, bucket: &Bucket) -> f64;
}

/// Built-in weighting rules.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum WeightingPolicy {
    /// Every item weighs 1.
    Uniform,
    /// `max(upvotes, 0)`.
    Engagement,
    /// `ln(1 + max(upvotes, 0))`, damping viral outliers.
    #[default]
    LogEngagement,
    /// `0.5^(age / half_life)`, age measured back from the bucket end.
    RecencyDecay { half_life_hours: f64 },
}

impl WeightingPolicy {
    /// Parse a policy name; recency decay takes a half-life, e.g. `recency:12`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "uniform" => Some(Self::Uniform),
            "engagement" => Some(Self::Engagement),
            "log_engagement" | "log-engagement" => Some(Self::LogEngagement),
            other => {
                let hours = other
                    .strip_prefix("recency:")
                    .or_else(|| other.strip_prefix("recency_decay:"))?;
                let half_life_hours: f64 = hours.parse().ok()?;
                (half_life_hours > 0.0).then_some(Self::RecencyDecay { half_life_hours })
            }
        }
    }
}

impl Weighting for WeightingPolicy {
    fn weight(&self, item: &ScoredItem, bucket: &Bucket) -> f64 {
        let upvotes = item.engagement.unwrap_or(0).max(0) as f64;
        match self {
            WeightingPolicy::Uniform => 1.0,
            WeightingPolicy::Engagement => upvotes,
            WeightingPolicy::LogEngagement => upvotes.ln_1p(),
            WeightingPolicy::RecencyDecay { half_life_hours } => {
                let age_hours =
                    (bucket.end - item.timestamp).num_milliseconds().max(0) as f64 / 3_600_000.0;
                0.5f64.powf(age_hours / half_life_hours)
            }
        }
    }
}

/// Clamp a policy's output: negative or non-finite weights count as zero.
pub fn sanitize_weight(w: f64) -> f64 {
    if w.is_finite() && w > 0.0 {
        w
    } else {
        0.0
    }
}
