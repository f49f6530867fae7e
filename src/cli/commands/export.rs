//! Export merge command.

use std::io::Write;
use std::path::Path;

use console::style;

use crate::config::Settings;
use crate::export::merge_run_exports;

use super::super::helpers::{open_blobs, open_leases};

/// Merge the counted shard outputs of a run into one JSONL stream.
pub async fn cmd_export(settings: &Settings, run_id: &str, output: Option<&Path>) -> anyhow::Result<()> {
    let leases = open_leases(settings).await?;
    let blobs = open_blobs(settings);
    let export = merge_run_exports(leases.store(), &blobs, run_id).await?;
    let bytes = export.to_jsonl()?;

    match output {
        Some(path) => {
            tokio::fs::write(path, &bytes).await?;
            eprintln!(
                "{} Wrote {} items from {} shards to {}",
                style("✓").green(),
                export.items.len(),
                export.shards_merged,
                path.display()
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }

    eprintln!("  sha256 {}", export.digest()?);
    if export.stale_blobs > 0 {
        eprintln!(
            "  {} skipped {} output(s) from attempts that lost their lease",
            style("!").yellow(),
            export.stale_blobs
        );
    }
    if !export.quarantined.is_empty() {
        eprintln!(
            "  {} quarantined {} malformed line(s)",
            style("!").yellow(),
            export.quarantined.len()
        );
    }
    if !export.missing_shards.is_empty() {
        eprintln!(
            "  {} {} complete shard(s) have no output: {}",
            style("✗").red(),
            export.missing_shards.len(),
            export.missing_shards.join(", ")
        );
    }
    Ok(())
}
