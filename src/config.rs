//! Configuration management for redditmeter using the prefer crate.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::WeightingPolicy;
use crate::lease::{LeaseConfig, DEFAULT_LEASE_MINUTES, DEFAULT_MAX_ATTEMPTS};
use crate::rollup::DEFAULT_CURRENT_WINDOW_HOURS;
use crate::scoring::ScorerConfig;
use crate::worker::{renew_interval_for, BatchLimits, WorkerConfig, DEFAULT_MAX_TEXT_CHARS};

/// Default database filename.
pub const DEFAULT_DATABASE_FILENAME: &str = "redditmeter.db";

/// Default blob subdirectory name.
const BLOBS_SUBDIR: &str = "blobs";

/// Application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename.
    pub database_filename: String,
    /// Database URL (overrides data_dir/database_filename if set).
    /// Only `sqlite:` URLs are understood.
    pub database_url: Option<String>,
    /// Root of the shard output blob store.
    pub blob_dir: PathBuf,
    pub lease_minutes: i64,
    pub max_attempts: u32,
    pub batch: BatchLimits,
    pub max_text_chars: usize,
    /// Consecutive empty claims before a worker stops.
    pub max_empty_polls: u32,
    pub poll_interval_secs: u64,
    /// Width of the trailing `current` window.
    pub current_window_hours: i64,
    pub weighting: WeightingPolicy,
    pub scorer: ScorerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        // Falls back gracefully: data dir -> home dir -> current dir
        let data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("redditmeter");

        Self {
            blob_dir: data_dir.join(BLOBS_SUBDIR),
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            database_url: None,
            lease_minutes: DEFAULT_LEASE_MINUTES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            batch: BatchLimits::default(),
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
            max_empty_polls: 3,
            poll_interval_secs: 10,
            current_window_hours: DEFAULT_CURRENT_WINDOW_HOURS,
            weighting: WeightingPolicy::default(),
            scorer: ScorerConfig::default(),
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            blob_dir: data_dir.join(BLOBS_SUBDIR),
            data_dir,
            ..Default::default()
        }
    }

    /// Path to the SQLite database, honoring a `sqlite:` database URL.
    pub fn database_path(&self) -> PathBuf {
        if let Some(ref url) = self.database_url {
            let path = url
                .strip_prefix("sqlite://")
                .or_else(|| url.strip_prefix("sqlite:"))
                .unwrap_or(url);
            return PathBuf::from(shellexpand::tilde(path).as_ref());
        }
        self.data_dir.join(&self.database_filename)
    }

    /// Ensure the data and blob directories exist.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.blob_dir)?;
        if let Some(parent) = self.database_path().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            max_attempts: self.max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn worker_config(&self, worker_id: impl Into<String>) -> WorkerConfig {
        WorkerConfig {
            lease_minutes: self.lease_minutes.max(1),
            batch: self.batch,
            max_text_chars: self.max_text_chars,
            max_empty_polls: self.max_empty_polls.max(1),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            renew_interval: renew_interval_for(self.lease_minutes),
            ..WorkerConfig::new(worker_id)
        }
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data directory path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Database filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Blob directory path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_records: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_text_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_empty_polls: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_window_hours: Option<i64>,
    /// Weighting policy name, e.g. `log_engagement` or `recency:12`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weighting: Option<String>,
    /// Scoring endpoint configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorer: Option<ScorerConfig>,

    /// Path the config was loaded from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer crate for discovery.
    /// Automatically discovers redditmeter config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("redditmeter").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => match Self::load_from_path(path).await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!("Ignoring config {}: {}", path.display(), e);
                        Self::default()
                    }
                },
                None => Self::default(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file path.
    /// Supports JSON, TOML and YAML based on file extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, String> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

        let mut config: Config = match ext {
            "toml" => toml::from_str(&contents)
                .map_err(|e| format!("Failed to parse TOML config: {}", e))?,
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .map_err(|e| format!("Failed to parse YAML config: {}", e))?,
            _ => serde_json::from_str(&contents)
                .map_err(|e| format!("Failed to parse JSON config: {}", e))?,
        };

        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Get the base directory for resolving relative paths.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    /// - Absolute paths are returned as-is
    /// - Paths starting with ~ are expanded
    /// - Relative paths are resolved relative to `base_dir`
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = shellexpand::tilde(path_str);
        let path = Path::new(expanded.as_ref());

        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.join(path)
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.data_dir = self.resolve_path(data_dir, base_dir);
            settings.blob_dir = settings.data_dir.join(BLOBS_SUBDIR);
        }
        if let Some(ref blob_dir) = self.blob_dir {
            settings.blob_dir = self.resolve_path(blob_dir, base_dir);
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }
        if let Some(minutes) = self.lease_minutes {
            settings.lease_minutes = minutes;
        }
        if let Some(attempts) = self.max_attempts {
            settings.max_attempts = attempts;
        }
        if let Some(records) = self.batch_records {
            settings.batch.max_records = records.max(1);
        }
        if let Some(chars) = self.batch_chars {
            settings.batch.max_chars = chars.max(1);
        }
        if let Some(chars) = self.max_text_chars {
            settings.max_text_chars = chars.max(1);
        }
        if let Some(polls) = self.max_empty_polls {
            settings.max_empty_polls = polls;
        }
        if let Some(secs) = self.poll_interval_secs {
            settings.poll_interval_secs = secs;
        }
        if let Some(hours) = self.current_window_hours {
            settings.current_window_hours = hours;
        }
        if let Some(ref name) = self.weighting {
            apply_weighting(settings, name, "config");
        }
        if let Some(ref scorer) = self.scorer {
            settings.scorer = scorer.clone();
        }
    }
}

fn apply_weighting(settings: &mut Settings, name: &str, source: &str) {
    match WeightingPolicy::parse(name) {
        Some(policy) => settings.weighting = policy,
        None => tracing::warn!("Unknown weighting policy '{}' from {}, keeping default", name, source),
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
    /// Data directory (--data flag).
    pub data: Option<PathBuf>,
}

/// Environment variable, if set and non-empty.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_value(name)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}='{}'", name, raw);
            None
        }
    }
}

/// Apply `RMETER_*` and `DATABASE_URL` overrides.
fn apply_env_overrides(settings: &mut Settings) {
    if let Some(dir) = env_value("RMETER_DATA_DIR") {
        settings.data_dir = PathBuf::from(shellexpand::tilde(&dir).as_ref());
        settings.blob_dir = settings.data_dir.join(BLOBS_SUBDIR);
    }
    if let Some(dir) = env_value("RMETER_BLOB_DIR") {
        settings.blob_dir = PathBuf::from(shellexpand::tilde(&dir).as_ref());
    }
    if let Some(url) = env_value("DATABASE_URL") {
        tracing::debug!("Using DATABASE_URL from environment: {}", url);
        settings.database_url = Some(url);
    }
    if let Some(minutes) = env_parse("RMETER_LEASE_MINUTES") {
        settings.lease_minutes = minutes;
    }
    if let Some(attempts) = env_parse("RMETER_MAX_ATTEMPTS") {
        settings.max_attempts = attempts;
    }
    if let Some(hours) = env_parse("RMETER_CURRENT_WINDOW_HOURS") {
        settings.current_window_hours = hours;
    }
    if let Some(name) = env_value("RMETER_WEIGHTING") {
        apply_weighting(settings, &name, "RMETER_WEIGHTING");
    }
    if let Some(endpoint) = env_value("RMETER_SCORER_URL") {
        settings.scorer.endpoint = endpoint;
    }
    if let Some(model) = env_value("RMETER_SCORER_MODEL") {
        settings.scorer.model = model;
    }
    if let Some(token) = env_value("RMETER_SCORER_TOKEN") {
        settings.scorer.api_token = Some(token);
    }
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Load settings with explicit options.
/// Priority, lowest first: defaults, config file, environment, `--data`.
pub async fn load_settings_with_options(options: LoadOptions) -> (Settings, Config) {
    let config = match options.config_path {
        Some(ref path) => Config::load_from_path(path).await.unwrap_or_else(|e| {
            tracing::warn!("{}", e);
            Config::default()
        }),
        None => Config::load().await,
    };

    let mut settings = Settings::default();
    let base_dir = config.base_dir().unwrap_or_else(current_dir);
    config.apply_to_settings(&mut settings, &base_dir);
    apply_env_overrides(&mut settings);

    if let Some(data) = options.data {
        let dir = if data.is_absolute() {
            data
        } else {
            current_dir().join(data)
        };
        settings.blob_dir = dir.join(BLOBS_SUBDIR);
        settings.data_dir = dir;
    }

    (settings, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_overrides_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "state"
            lease_minutes = 5
            batch_records = 8
            weighting = "recency:6"

            [scorer]
            endpoint = "http://scorer:9000/predict"
            "#,
        )
        .unwrap();

        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings, Path::new("/srv"));
        assert_eq!(settings.data_dir, PathBuf::from("/srv/state"));
        assert_eq!(settings.blob_dir, PathBuf::from("/srv/state/blobs"));
        assert_eq!(settings.lease_minutes, 5);
        assert_eq!(settings.batch.max_records, 8);
        assert_eq!(
            settings.weighting,
            WeightingPolicy::RecencyDecay {
                half_life_hours: 6.0
            }
        );
        assert_eq!(settings.scorer.endpoint, "http://scorer:9000/predict");
        assert_eq!(settings.scorer.timeout_secs, 120);
    }

    #[test]
    fn unknown_weighting_keeps_default() {
        let config = Config {
            weighting: Some("loudest".to_string()),
            ..Default::default()
        };
        let mut settings = Settings::default();
        config.apply_to_settings(&mut settings, Path::new("/"));
        assert_eq!(settings.weighting, WeightingPolicy::LogEngagement);
    }

    #[test]
    fn database_url_wins_over_data_dir() {
        let mut settings = Settings::with_data_dir(PathBuf::from("/data"));
        assert_eq!(settings.database_path(), PathBuf::from("/data/redditmeter.db"));
        settings.database_url = Some("sqlite:///tmp/other.db".to_string());
        assert_eq!(settings.database_path(), PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn worker_config_follows_settings() {
        let mut settings = Settings::default();
        settings.lease_minutes = 2;
        settings.poll_interval_secs = 1;
        let worker = settings.worker_config("w1");
        assert_eq!(worker.worker_id, "w1");
        assert_eq!(worker.lease_minutes, 2);
        assert_eq!(worker.poll_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn loads_yaml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redditmeter.yaml");
        std::fs::write(&path, "max_attempts: 5\ncurrent_window_hours: 12\n").unwrap();
        let config = Config::load_from_path(&path).await.unwrap();
        assert_eq!(config.max_attempts, Some(5));
        assert_eq!(config.base_dir(), Some(dir.path().to_path_buf()));
    }
}
