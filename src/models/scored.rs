//! Input records and scored items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Emotion, EmotionScores, TopicKey};

/// Reasons a scored item is rejected at a store boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("score for {emotion} out of range: {value}")]
    ScoreOutOfRange { emotion: Emotion, value: f64 },
    #[error("no emotion scores")]
    NoScores,
}

/// A raw post as read from the source dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub id: String,
    pub subreddit: String,
    #[serde(default)]
    pub topic: Option<String>,
    /// RFC 3339 string or Unix seconds (Reddit's native `created_utc`).
    #[serde(deserialize_with = "deserialize_created")]
    pub created_utc: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "text")]
    pub body: String,
    #[serde(default)]
    pub comments: Vec<String>,
    /// Upvote score, when the source provides one.
    #[serde(default, alias = "post_score")]
    pub score: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Seconds(f64),
    Text(String),
}

fn deserialize_created<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Seconds(secs) => {
            DateTime::from_timestamp(secs.trunc() as i64, (secs.fract() * 1e9) as u32)
                .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {}", secs)))
        }
        RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(D::Error::custom),
    }
}

/// One classified post or comment. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    pub source_id: String,
    pub subreddit: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub scores: EmotionScores,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engagement: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

fn default_topic() -> String {
    "general".to_string()
}

impl ScoredItem {
    /// Attach scores to the record they were produced from.
    pub fn from_record(record: &InputRecord, scores: EmotionScores, model_id: &str) -> Self {
        Self {
            source_id: record.id.clone(),
            subreddit: record.subreddit.clone(),
            topic: record.topic.clone().unwrap_or_else(default_topic),
            timestamp: record.created_utc,
            scores,
            engagement: record.score,
            model_id: Some(model_id.to_string()),
        }
    }

    pub fn topic_key(&self) -> TopicKey {
        TopicKey::new(&self.subreddit, &self.topic)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_id.trim().is_empty() {
            return Err(ValidationError::MissingField("source_id"));
        }
        if self.subreddit.trim().is_empty() {
            return Err(ValidationError::MissingField("subreddit"));
        }
        if self.scores.is_empty() {
            return Err(ValidationError::NoScores);
        }
        if let Some((emotion, value)) = self.scores.first_out_of_range() {
            return Err(ValidationError::ScoreOutOfRange { emotion, value });
        }
        Ok(())
    }
}
