//! HTTP adapter for a Hugging Face style text-classification endpoint.
//!
//! Request: `{"inputs": [...], "parameters": {"top_k": null}}`.
//! Response: one list of `{label, score}` per input.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ScoringError, ScoringFunction};
use crate::models::EmotionScores;

/// Configuration for the HTTP scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// Classification endpoint URL.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Model identifier recorded on scored items.
    #[serde(default = "default_model")]
    pub model: String,
    /// Bearer token, if the endpoint requires one.
    #[serde(default)]
    pub api_token: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    "http://localhost:8080/predict".to_string()
}

fn default_model() -> String {
    "j-hartmann/emotion-english-distilroberta-base".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_token: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    inputs: &'a [String],
    parameters: ClassifyParameters,
}

#[derive(Debug, Serialize)]
struct ClassifyParameters {
    top_k: Option<u32>,
    truncation: bool,
}

#[derive(Debug, Deserialize)]
struct LabelScore {
    label: String,
    score: f64,
}

pub struct HttpScorer {
    config: ScorerConfig,
    client: Client,
}

impl HttpScorer {
    pub fn new(config: ScorerConfig) -> Result<Self, ScoringError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ScoringError::Connection(e.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }
}

/// Map a non-success response to the scoring error taxonomy.
fn classify_failure(status: StatusCode, body: &str) -> ScoringError {
    let lower = body.to_lowercase();
    let oom = lower.contains("out of memory") || lower.contains("outofmemoryerror");
    if status == StatusCode::PAYLOAD_TOO_LARGE || status == StatusCode::INSUFFICIENT_STORAGE || oom
    {
        ScoringError::ResourceExhausted(format!("HTTP {}: {}", status, body.trim()))
    } else if matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    ) {
        ScoringError::Connection(format!("HTTP {}: {}", status, body.trim()))
    } else {
        ScoringError::Failed(format!("HTTP {}: {}", status, body.trim()))
    }
}

/// Parse a response body into score vectors.
fn parse_scores(body: &str, expected: usize) -> Result<Vec<EmotionScores>, ScoringError> {
    let raw: Vec<Vec<LabelScore>> = match serde_json::from_str(body) {
        Ok(raw) => raw,
        // Single-input endpoints sometimes return a flat list.
        Err(_) if expected == 1 => vec![serde_json::from_str::<Vec<LabelScore>>(body)
            .map_err(|e| ScoringError::Failed(format!("unparseable response: {}", e)))?],
        Err(e) => return Err(ScoringError::Failed(format!("unparseable response: {}", e))),
    };

    if raw.len() != expected {
        return Err(ScoringError::LengthMismatch {
            expected,
            got: raw.len(),
        });
    }

    Ok(raw
        .iter()
        .map(|labels| EmotionScores::from_labels(labels.iter().map(|l| (l.label.as_str(), l.score))))
        .collect())
}

#[async_trait]
impl ScoringFunction for HttpScorer {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    async fn score(&self, texts: &[String]) -> Result<Vec<EmotionScores>, ScoringError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = ClassifyRequest {
            inputs: texts,
            parameters: ClassifyParameters {
                top_k: None,
                truncation: true,
            },
        };

        let mut builder = self.client.post(&self.config.endpoint).json(&request);
        if let Some(token) = &self.config.api_token {
            builder = builder.bearer_auth(token);
        }

        debug!(batch = texts.len(), "Scoring batch");
        let resp = builder
            .send()
            .await
            .map_err(|e| ScoringError::Connection(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ScoringError::Connection(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }
        parse_scores(&body, texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Emotion;

    #[test]
    fn parses_batched_response() {
        let body = r#"[[{"label":"joy","score":0.9},{"label":"anger","score":0.05}],
                       [{"label":"sadness","score":0.7},{"label":"neutral","score":0.3}]]"#;
        let scores = parse_scores(body, 2).unwrap();
        assert_eq!(scores[0].get(Emotion::Joy), Some(0.9));
        assert_eq!(scores[1].get(Emotion::Sadness), Some(0.7));
        assert_eq!(scores[1].iter().count(), 1);
    }

    #[test]
    fn parses_flat_single_response() {
        let body = r#"[{"label":"fear","score":0.6}]"#;
        let scores = parse_scores(body, 1).unwrap();
        assert_eq!(scores[0].get(Emotion::Fear), Some(0.6));
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let body = r#"[[{"label":"joy","score":0.9}]]"#;
        assert!(matches!(
            parse_scores(body, 3),
            Err(ScoringError::LengthMismatch { expected: 3, got: 1 })
        ));
    }

    #[test]
    fn oom_is_resource_exhaustion() {
        assert!(classify_failure(StatusCode::PAYLOAD_TOO_LARGE, "").is_resource_exhausted());
        assert!(
            classify_failure(StatusCode::INTERNAL_SERVER_ERROR, "CUDA out of memory")
                .is_resource_exhausted()
        );
        assert!(!classify_failure(StatusCode::SERVICE_UNAVAILABLE, "loading").is_resource_exhausted());
    }

    #[test]
    fn gateway_errors_mean_backend_unavailable() {
        assert!(classify_failure(StatusCode::SERVICE_UNAVAILABLE, "loading").is_unavailable());
        assert!(classify_failure(StatusCode::BAD_GATEWAY, "").is_unavailable());
        assert!(!classify_failure(StatusCode::BAD_REQUEST, "bad input").is_unavailable());
    }
}
