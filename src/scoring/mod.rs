//! Emotion scoring boundary.
//!
//! The scoring function is opaque: an ordered batch of texts goes in, a
//! parallel sequence of score vectors comes out. Resource exhaustion is
//! reported separately from other failures so callers can shrink the batch
//! and retry.

mod http;
mod text;

pub use http::{HttpScorer, ScorerConfig};
pub use text::{clean_text, prepare_for_input, truncate_chars, MAX_COMMENTS};

use std::sync::Arc;

use async_trait::async_trait;

use crate::models::EmotionScores;

#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    /// Batch too large for the backend (out of memory, payload too large).
    #[error("Scoring resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Scoring backend unreachable: {0}")]
    Connection(String),

    #[error("Scoring failed: {0}")]
    Failed(String),

    #[error("Scorer returned {got} results for {expected} inputs")]
    LengthMismatch { expected: usize, got: usize },
}

impl ScoringError {
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, ScoringError::ResourceExhausted(_))
    }

    /// The backend itself is down; no shard is at fault.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ScoringError::Connection(_))
    }
}

#[async_trait]
pub trait ScoringFunction: Send + Sync {
    /// Identifier recorded on every scored item.
    fn model_id(&self) -> &str;

    /// Score `texts`, returning one vector per input in the same order.
    async fn score(&self, texts: &[String]) -> Result<Vec<EmotionScores>, ScoringError>;
}

pub type BoxedScorer = Arc<dyn ScoringFunction>;
