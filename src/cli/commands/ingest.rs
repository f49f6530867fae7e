//! Scored item ingest command.

use std::path::PathBuf;

use console::style;

use crate::config::Settings;
use crate::export::{merge_run_exports, parse_scored_jsonl};

use super::super::helpers::{open_blobs, open_leases, open_pipeline};

/// Ingest scored items from files or a run's merged export.
pub async fn cmd_ingest(
    settings: &Settings,
    files: &[PathBuf],
    run: Option<&str>,
    no_refresh: bool,
) -> anyhow::Result<()> {
    let mut items = Vec::new();
    let mut quarantined = Vec::new();

    if let Some(run_id) = run {
        let leases = open_leases(settings).await?;
        let export = merge_run_exports(leases.store(), &open_blobs(settings), run_id).await?;
        quarantined.extend(export.quarantined);
        items.extend(export.items);
    }
    for path in files {
        let bytes = tokio::fs::read(path).await?;
        let name = path.display().to_string();
        items.extend(parse_scored_jsonl(&name, &bytes, &mut quarantined));
    }
    if items.is_empty() && quarantined.is_empty() {
        anyhow::bail!("Nothing to ingest: pass scored JSONL files or --run");
    }

    let pipeline = open_pipeline(settings).await?;
    let report = pipeline.ingest(items).await?;
    println!(
        "{} Ingested {} new of {} items ({} rejected, {} malformed lines)",
        style("✓").green(),
        report.inserted,
        report.received,
        report.rejected.len(),
        quarantined.len()
    );

    if no_refresh {
        return Ok(());
    }
    let refresh = pipeline.refresh(&report.touched).await?;
    println!(
        "{} Refreshed {} bucket(s), {} rollups; current snapshot has {} keys",
        style("✓").green(),
        refresh.buckets,
        refresh.rollups_written,
        refresh.current_keys
    );
    Ok(())
}
