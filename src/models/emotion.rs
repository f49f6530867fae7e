//! The fixed emotion label set and per-item score vectors.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Emotion labels produced by the classifier head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    Joy,
    Sadness,
    Anger,
    Fear,
    Love,
    Surprise,
}

impl Emotion {
    pub const ALL: [Emotion; 6] = [
        Emotion::Joy,
        Emotion::Sadness,
        Emotion::Anger,
        Emotion::Fear,
        Emotion::Love,
        Emotion::Surprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joy => "joy",
            Self::Sadness => "sadness",
            Self::Anger => "anger",
            Self::Fear => "fear",
            Self::Love => "love",
            Self::Surprise => "surprise",
        }
    }

    /// Parse a label, case-insensitively. Classifier endpoints are not
    /// consistent about casing (`LABEL_joy`, `Joy`, `joy`).
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        let label = label.strip_prefix("label_").unwrap_or(&label);
        match label {
            "joy" => Some(Self::Joy),
            "sadness" => Some(Self::Sadness),
            "anger" => Some(Self::Anger),
            "fear" => Some(Self::Fear),
            "love" => Some(Self::Love),
            "surprise" => Some(Self::Surprise),
            _ => None,
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Score vector over the fixed label set.
///
/// Values are confidences in `[0, 1]`; they need not sum to one. Labels the
/// model did not emit are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmotionScores(BTreeMap<Emotion, f64>);

impl EmotionScores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, emotion: Emotion, score: f64) -> Self {
        self.0.insert(emotion, score);
        self
    }

    pub fn insert(&mut self, emotion: Emotion, score: f64) {
        self.0.insert(emotion, score);
    }

    pub fn get(&self, emotion: Emotion) -> Option<f64> {
        self.0.get(&emotion).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f64)> + '_ {
        self.0.iter().map(|(e, s)| (*e, *s))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build from raw `(label, score)` pairs, dropping labels outside the set.
    pub fn from_labels<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let mut scores = Self::new();
        for (label, score) in pairs {
            if let Some(emotion) = Emotion::from_label(label) {
                scores.insert(emotion, score);
            }
        }
        scores
    }

    /// Returns the first label whose score is not a finite value in `[0, 1]`.
    pub fn first_out_of_range(&self) -> Option<(Emotion, f64)> {
        self.iter()
            .find(|(_, s)| !s.is_finite() || *s < 0.0 || *s > 1.0)
    }
}
