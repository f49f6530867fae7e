//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod export;
mod ingest;
mod rollup;
mod runs;
mod serve;
mod work;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{load_settings_with_options, LoadOptions};

#[derive(Parser)]
#[command(name = "rmeter")]
#[command(about = "Reddit emotion scoring, aggregation and sentiment API")]
#[command(version)]
pub struct Cli {
    /// Data directory (overrides config file)
    #[arg(long, short = 'd', global = true, env = "RMETER_DATA")]
    data: Option<PathBuf>,

    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Manage annotation runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },

    /// Claim and score shards of a run until it drains
    Work {
        /// Run ID
        run_id: String,
        /// Input JSONL (defaults to the run's source dataset)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Number of concurrent workers in this process
        #[arg(short, long, default_value = "1")]
        workers: usize,
        /// Worker ID prefix (default: hostname-pid)
        #[arg(long)]
        worker_id: Option<String>,
        /// Lease duration in minutes (overrides config)
        #[arg(long)]
        lease_minutes: Option<i64>,
        /// Scoring endpoint (overrides config)
        #[arg(long, env = "RMETER_SCORER_URL")]
        endpoint: Option<String>,
    },

    /// Merge a run's shard outputs into one JSONL file
    Export {
        /// Run ID
        run_id: String,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Ingest scored items and refresh affected rollups
    Ingest {
        /// Scored JSONL files
        files: Vec<PathBuf>,
        /// Ingest the merged export of a run instead of files
        #[arg(long)]
        run: Option<String>,
        /// Store items without recomputing rollups
        #[arg(long)]
        no_refresh: bool,
    },

    /// Recompute the current snapshot and calendar rollups
    Rollup {
        /// Also recompute every day/week/month bucket since this date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,
    },

    /// Start the read-only sentiment API
    Serve {
        /// Address to bind to: PORT, HOST, or HOST:PORT (default: 127.0.0.1:3030)
        #[arg(default_value = "127.0.0.1:3030")]
        bind: String,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Create a run and shard its input dataset
    Create {
        /// Run ID
        run_id: String,
        /// Input JSONL with one post per line
        #[arg(short, long)]
        input: PathBuf,
        /// Records per shard
        #[arg(short, long, default_value = "1000")]
        shard_size: u64,
        /// Model ID recorded on the run (defaults to the configured scorer model)
        #[arg(short, long)]
        model: Option<String>,
        /// Dataset revision
        #[arg(long)]
        revision: Option<String>,
    },

    /// Show shard counts and failures for a run
    Status {
        /// Run ID
        run_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Cancel a run; workers stop at their next poll
    Cancel {
        /// Run ID
        run_id: String,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        data: cli.data,
    };
    let (mut settings, _config) = load_settings_with_options(options).await;

    match cli.command {
        Commands::Run { command } => match command {
            RunCommands::Create {
                run_id,
                input,
                shard_size,
                model,
                revision,
            } => runs::cmd_run_create(&settings, &run_id, &input, shard_size, model, revision).await,
            RunCommands::Status { run_id, json } => {
                runs::cmd_run_status(&settings, &run_id, json).await
            }
            RunCommands::Cancel { run_id } => runs::cmd_run_cancel(&settings, &run_id).await,
        },
        Commands::Work {
            run_id,
            input,
            workers,
            worker_id,
            lease_minutes,
            endpoint,
        } => {
            if let Some(minutes) = lease_minutes {
                settings.lease_minutes = minutes;
            }
            if let Some(endpoint) = endpoint {
                settings.scorer.endpoint = endpoint;
            }
            work::cmd_work(&settings, &run_id, input, workers, worker_id).await
        }
        Commands::Export { run_id, output } => {
            export::cmd_export(&settings, &run_id, output.as_deref()).await
        }
        Commands::Ingest {
            files,
            run,
            no_refresh,
        } => ingest::cmd_ingest(&settings, &files, run.as_deref(), no_refresh).await,
        Commands::Rollup { since } => rollup::cmd_rollup(&settings, since.as_deref()).await,
        Commands::Serve { bind } => serve::cmd_serve(&settings, &bind).await,
    }
}
