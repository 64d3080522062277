//! Operator CLI for the job delivery core.
//!
//! Every command prints one JSON document on stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_core::common::init_tracing;
use relay_core::config::Config;
use relay_core::kernel::jobs::{HandlerRegistry, JobAdmin, JobStatus, ReviewAction};
use relay_core::kernel::QueueKernel;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "relay_admin")]
#[command(about = "Inspect and repair the job ledger, dead letter store and spool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Dashboard snapshot
    Stats {
        /// Stats window in seconds
        #[arg(long, default_value_t = 86_400)]
        window_secs: u64,
    },

    /// Ledger jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },

    /// Dead letter store
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },

    /// Fallback spool
    Spool {
        #[command(subcommand)]
        command: SpoolCommand,
    },
}

#[derive(Subcommand)]
enum JobsCommand {
    /// List jobs, newest first
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Show one job
    Get { id: Uuid },

    /// Reset FAILED jobs to PENDING
    RetryFailed {
        #[arg(long)]
        job_type: Option<String>,
    },

    /// Delete FAILED jobs older than the given age
    PurgeFailed {
        #[arg(long, default_value_t = 7 * 24)]
        older_than_hours: u64,
    },
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List entries; only unreviewed manual-review entries with --pending
    List {
        #[arg(long)]
        pending: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Record a review decision
    Review {
        id: Uuid,
        /// retry | discard
        #[arg(long)]
        action: ReviewAction,
        #[arg(long)]
        reviewed_by: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Subcommand)]
enum SpoolCommand {
    Stats,

    /// Delete processed rows older than the given age
    Cleanup {
        #[arg(long, default_value_t = 24)]
        older_than_hours: i64,
    },
}

/// Age given in hours; absurd values clamp instead of overflowing.
fn hours(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

fn output<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let kernel = QueueKernel::connect(config, Arc::new(HandlerRegistry::new())).await?;

    run(&kernel, cli.command).await
}

async fn run(kernel: &QueueKernel, command: Commands) -> Result<()> {
    let admin: JobAdmin = kernel.admin();

    match command {
        Commands::Migrate => {
            sqlx::migrate!("./migrations")
                .run(&kernel.db_pool)
                .await
                .context("Failed to run migrations")?;
            output(&json!({ "success": true, "message": "migrations applied" }))
        }
        Commands::Stats { window_secs } => {
            output(&admin.dashboard(Duration::from_secs(window_secs)).await?)
        }
        Commands::Jobs { command } => match command {
            JobsCommand::List { status, limit } => output(&admin.list_jobs(status, limit).await?),
            JobsCommand::Get { id } => {
                let job = admin
                    .get_job(id)
                    .await?
                    .with_context(|| format!("job {} not found", id))?;
                output(&job)
            }
            JobsCommand::RetryFailed { job_type } => {
                let count = admin.retry_failed(job_type.as_deref()).await?;
                output(&json!({ "success": true, "count": count }))
            }
            JobsCommand::PurgeFailed { older_than_hours } => {
                let count = admin
                    .purge_failed(hours(older_than_hours))
                    .await?;
                output(&json!({ "success": true, "count": count }))
            }
        },
        Commands::Dlq { command } => match command {
            DlqCommand::List { pending, limit } => {
                let entries = if pending {
                    admin.pending_reviews(limit).await?
                } else {
                    admin.dead_letters(limit).await?
                };
                output(&entries)
            }
            DlqCommand::Review {
                id,
                action,
                reviewed_by,
                notes,
            } => output(&admin.review(id, action, &reviewed_by, notes).await?),
        },
        Commands::Spool { command } => match command {
            SpoolCommand::Stats => output(&admin.spool_stats().await?),
            SpoolCommand::Cleanup { older_than_hours } => {
                let count = admin.cleanup_spool(older_than_hours).await?;
                output(&json!({ "success": true, "count": count }))
            }
        },
    }
}
