//! Data models for redditmeter.

mod emotion;
mod rollup;
mod run;
mod scored;
mod shard;

pub use emotion::{Emotion, EmotionScores};
pub use rollup::{Bucket, BucketKind, Contributor, EmotionStat, SentimentRollup, TopicKey};
pub use run::{AnnotationRun, RunConfig, RunStatus};
pub use scored::{InputRecord, ScoredItem, ValidationError};
pub use shard::{shard_id_for, ShardStatus, ShardTask};
