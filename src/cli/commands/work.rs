//! Annotation worker command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use console::style;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::scoring::{BoxedScorer, HttpScorer};
use crate::worker::{AnnotationWorker, InputSource, JsonlInputSource, StopReason, WorkerEvent};

use super::super::helpers::{default_worker_prefix, open_blobs, open_leases, truncate};

/// Run `workers` annotation workers against a run until it drains.
pub async fn cmd_work(
    settings: &Settings,
    run_id: &str,
    input: Option<PathBuf>,
    workers: usize,
    worker_id: Option<String>,
) -> anyhow::Result<()> {
    let leases = open_leases(settings).await?;
    let run = leases
        .store()
        .get_run(run_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Run not found: {}", run_id))?;

    let input_path = input.unwrap_or_else(|| PathBuf::from(&run.config.source_dataset));
    let input: Arc<dyn InputSource> = Arc::new(JsonlInputSource::new(&input_path));
    let scorer: BoxedScorer = Arc::new(HttpScorer::new(settings.scorer.clone())?);
    let blobs = open_blobs(settings);
    let prefix = worker_id.unwrap_or_else(default_worker_prefix);
    let workers = workers.max(1);

    println!(
        "{} Working run {} with {} worker(s) against {}",
        style("→").cyan(),
        style(run_id).bold(),
        workers,
        settings.scorer.endpoint
    );

    let (event_tx, mut event_rx) = mpsc::channel::<WorkerEvent>(256);
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {pos} shards done {wide_msg}")
            .unwrap(),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    let pb = spinner.clone();

    let event_handler = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                WorkerEvent::ShardClaimed {
                    shard_id,
                    attempt,
                    records,
                } => {
                    pb.set_message(format!("{} (attempt {}, {} records)", shard_id, attempt, records));
                }
                WorkerEvent::BatchShrunk { shard_id, size } => {
                    pb.set_message(format!("{} batch shrunk to {}", shard_id, size));
                }
                WorkerEvent::ShardCompleted { .. } => pb.inc(1),
                WorkerEvent::ShardDiscarded { shard_id } => {
                    pb.println(format!(
                        "{} {} lost its lease, output discarded",
                        style("!").yellow(),
                        shard_id
                    ));
                }
                WorkerEvent::ShardFailed { shard_id, error } => {
                    pb.println(format!(
                        "{} {}: {}",
                        style("✗").red(),
                        shard_id,
                        truncate(&error, 100)
                    ));
                }
                WorkerEvent::Idle { empty_polls } => {
                    pb.set_message(format!("waiting for shards ({} empty polls)", empty_polls));
                }
            }
        }
    });

    let tasks = (0..workers).map(|i| {
        let worker = AnnotationWorker::new(
            leases.clone(),
            input.clone(),
            scorer.clone(),
            blobs.clone(),
            settings.worker_config(format!("{}-{}", prefix, i)),
        )
        .with_events(event_tx.clone());
        async move { worker.run(run_id).await }
    });
    let results = join_all(tasks).await;
    drop(event_tx);
    let _ = event_handler.await;
    spinner.finish_and_clear();

    let mut first_error = None;
    let (mut completed, mut discarded, mut failed, mut items) = (0, 0, 0, 0);
    let mut finalized = false;
    let mut stop = StopReason::Drained;
    for result in results {
        match result {
            Ok(report) => {
                completed += report.completed;
                discarded += report.discarded;
                failed += report.failed;
                items += report.items_scored;
                finalized |= report.finalized;
                if report.stop != StopReason::Drained {
                    stop = report.stop;
                }
            }
            Err(e) => {
                eprintln!("{} Worker aborted: {}", style("✗").red(), e);
                first_error.get_or_insert(e);
            }
        }
    }

    println!(
        "{} {} shards completed ({} items), {} discarded, {} failed",
        style("✓").green(),
        completed,
        items,
        discarded,
        failed
    );
    if let StopReason::RunInactive(status) = stop {
        println!("  Run is {}, workers stopped", status.as_str());
    }
    if finalized {
        println!("  Every shard is terminal; run marked complete");
    }

    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
