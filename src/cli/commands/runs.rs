//! Annotation run management commands.

use std::path::Path;

use console::style;

use crate::config::Settings;
use crate::models::RunConfig;
use crate::worker::{InputSource, JsonlInputSource};

use super::super::helpers::open_leases;

/// Create a run over an input dataset.
pub async fn cmd_run_create(
    settings: &Settings,
    run_id: &str,
    input: &Path,
    shard_size: u64,
    model: Option<String>,
    revision: Option<String>,
) -> anyhow::Result<()> {
    let source = JsonlInputSource::new(input);
    let total_records = source.len().await?;
    if total_records == 0 {
        anyhow::bail!("Input {} has no records", input.display());
    }

    let leases = open_leases(settings).await?;
    let run = leases
        .create_run(
            run_id,
            RunConfig {
                model_id: model.unwrap_or_else(|| settings.scorer.model.clone()),
                source_dataset: input.display().to_string(),
                revision,
                shard_size,
                total_records,
            },
        )
        .await?;

    println!(
        "{} Created run {} ({} records in {} shards of {})",
        style("✓").green(),
        style(&run.run_id).bold(),
        total_records,
        run.shard_count(),
        shard_size
    );
    Ok(())
}

/// Print shard counts and failures.
pub async fn cmd_run_status(settings: &Settings, run_id: &str, json: bool) -> anyhow::Result<()> {
    let leases = open_leases(settings).await?;
    let progress = leases.run_status(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }

    println!(
        "{} Run {} [{}] model {}",
        style("→").cyan(),
        style(&progress.run.run_id).bold(),
        progress.run.status.as_str(),
        progress.run.config.model_id
    );
    println!(
        "  {:>6} total  {:>6} unclaimed  {:>6} in flight  {:>6} expired",
        progress.total, progress.unclaimed, progress.in_flight, progress.expired
    );
    println!(
        "  {:>6} complete  {:>6} failed  ({:.1}% done)",
        style(progress.complete).green(),
        style(progress.failed).red(),
        progress.percent_complete()
    );
    for failure in &progress.failures {
        println!(
            "  {} {} after {} attempts: {}",
            style("✗").red(),
            failure.shard_id,
            failure.attempts,
            failure.reason.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

pub async fn cmd_run_cancel(settings: &Settings, run_id: &str) -> anyhow::Result<()> {
    let leases = open_leases(settings).await?;
    if !leases.cancel_run(run_id).await? {
        let status = leases.run_state(run_id).await?;
        anyhow::bail!("Run {} is already {}", run_id, status.as_str());
    }
    println!(
        "{} Cancelled run {}; workers stop at their next poll",
        style("!").yellow(),
        run_id
    );
    Ok(())
}
