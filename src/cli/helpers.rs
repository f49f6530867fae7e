//! Shared helper functions for CLI commands.

use std::sync::Arc;

use crate::blob::{BoxedBlobStore, FsBlobStore};
use crate::config::Settings;
use crate::lease::LeaseManager;
use crate::rollup::RollupPipeline;
use crate::rollup_store::SqliteRollupStore;
use crate::shard_store::SqliteShardStore;

/// Open the shard store and wrap it in a lease manager.
pub async fn open_leases(settings: &Settings) -> anyhow::Result<LeaseManager> {
    settings.ensure_directories()?;
    let store = SqliteShardStore::new(&settings.database_path()).await?;
    Ok(LeaseManager::new(Arc::new(store), settings.lease_config()))
}

pub fn open_blobs(settings: &Settings) -> BoxedBlobStore {
    Arc::new(FsBlobStore::new(settings.blob_dir.clone()))
}

/// Open the item/rollup store and build the pipeline from settings.
pub async fn open_pipeline(settings: &Settings) -> anyhow::Result<RollupPipeline> {
    settings.ensure_directories()?;
    let store = Arc::new(SqliteRollupStore::new(&settings.database_path()).await?);
    Ok(RollupPipeline::new(
        store.clone(),
        store,
        Arc::new(settings.weighting.clone()),
    )
    .with_current_window(settings.current_window_hours))
}

/// Default worker id prefix: `<hostname>-<pid>`.
pub fn default_worker_prefix() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Truncate a string for single-line display.
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}
