//! Job runner service for processing ledger jobs.
//!
//! The `JobRunner` is a background service that:
//! - Claims ready jobs through the reliability layer (breakers honoured)
//! - Executes them via the `JobExecutor` (tenant context + handler registry)
//! - Records each outcome (complete, retry with backoff, dead-letter)
//!
//! # Architecture
//!
//! ```text
//! JobRunner
//!     │
//!     ├─► ReliableJobQueue::process_next (claim + execute + record)
//!     │       └─► repeat until batch_size jobs or the ledger is empty
//!     └─► sleep poll_interval (cancellable)
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::executor::JobExecutor;
use super::reliability::ReliableJobQueue;

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Maximum number of jobs to process between polls
    pub batch_size: usize,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// Restrict this runner to one job type
    pub job_type: Option<String>,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            job_type: None,
            worker_id: format!("runner-{}", Uuid::new_v4()),
        }
    }
}

impl JobRunnerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Background service that processes jobs from the ledger.
pub struct JobRunner {
    queue: Arc<ReliableJobQueue>,
    executor: JobExecutor,
    config: JobRunnerConfig,
}

impl JobRunner {
    pub fn new(queue: Arc<ReliableJobQueue>, executor: JobExecutor) -> Self {
        Self::with_config(queue, executor, JobRunnerConfig::default())
    }

    pub fn with_config(
        queue: Arc<ReliableJobQueue>,
        executor: JobExecutor,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            config,
        }
    }

    /// Process up to one batch. Returns how many jobs were handled.
    pub async fn run_batch(&self) -> Result<usize> {
        let mut processed = 0;
        while processed < self.config.batch_size {
            match self
                .queue
                .process_next(&self.executor, self.config.job_type.as_deref())
                .await?
            {
                Some(job) => {
                    debug!(
                        worker_id = %self.config.worker_id,
                        job_id = %job.job_id,
                        job_type = %job.job_type,
                        disposition = ?job.disposition,
                        "job processed"
                    );
                    processed += 1;
                }
                None => break,
            }
        }
        Ok(processed)
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Cancellation is only observed between batches; a job in flight runs
    /// to completion.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            job_type = ?self.config.job_type,
            "job runner starting"
        );

        while !shutdown.is_cancelled() {
            let delay = match self.run_batch().await {
                Ok(n) if n >= self.config.batch_size => Duration::ZERO,
                Ok(_) => self.config.poll_interval,
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "failed to process jobs");
                    Duration::from_secs(1)
                }
            };

            if delay.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "job runner stopped");
        Ok(())
    }
}
