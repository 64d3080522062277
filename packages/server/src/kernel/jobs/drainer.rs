//! Spool drainer.
//!
//! Reconciliation loop between the fallback spool and the broker. Each cycle:
//! 1. probes broker health
//! 2. healthy: announces a batch of spooled jobs on the broker
//! 3. degraded: claims a batch in the ledger and runs it inline
//!
//! Spool rows are copies of ledger jobs, so the ledger decides what happens:
//! rows whose job has settled are dropped, and inline runs are settled with
//! `record_outcome` like any other attempt. A row with no ledger job is
//! dead-lettered. The loop polls faster while degraded to shrink the fallback
//! window, and backs off multiplicatively when whole cycles fail.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dead_letter::{requires_manual_review, NewDeadLetterEntry};
use super::executor::JobExecutor;
use super::reliability::{JobClaim, JobDisposition, ReliableJobQueue};
use super::spool::{JobSpool, SpooledJob};
use crate::kernel::broker::{Broker, BrokerJob};

#[derive(Debug, Clone)]
pub struct DrainerConfig {
    pub healthy_interval: Duration,
    pub degraded_interval: Duration,
    pub batch_size: i64,
    /// Ceiling for the failure backoff
    pub max_backoff: Duration,
    /// Bound on each broker call
    pub broker_timeout: Duration,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            healthy_interval: Duration::from_secs(10),
            degraded_interval: Duration::from_secs(5),
            batch_size: 25,
            max_backoff: Duration::from_secs(300),
            broker_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerHealth {
    Healthy,
    Degraded,
}

/// What one drain cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub health: BrokerHealth,
    pub claimed: usize,
    pub moved_to_broker: usize,
    pub executed_inline: usize,
    pub dead_lettered: usize,
    /// Rows dropped because their ledger job had already settled
    pub settled: usize,
    /// Rows left alone because the ledger job was not claimable yet
    pub deferred: usize,
    /// Rows left in the spool after an error
    pub failed: usize,
}

impl CycleReport {
    fn new(health: BrokerHealth, claimed: usize) -> Self {
        Self {
            health,
            claimed,
            moved_to_broker: 0,
            executed_inline: 0,
            dead_lettered: 0,
            settled: 0,
            deferred: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct DrainerCounters {
    cycles: AtomicU64,
    moved_to_broker: AtomicU64,
    executed_inline: AtomicU64,
    dead_lettered: AtomicU64,
    settled: AtomicU64,
    errors: AtomicU64,
    consecutive_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DrainerStats {
    pub cycles: u64,
    pub moved_to_broker: u64,
    pub executed_inline: u64,
    pub dead_lettered: u64,
    pub settled: u64,
    pub errors: u64,
    pub consecutive_failures: u64,
}

impl DrainerCounters {
    pub fn snapshot(&self) -> DrainerStats {
        DrainerStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            moved_to_broker: self.moved_to_broker.load(Ordering::Relaxed),
            executed_inline: self.executed_inline.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            settled: self.settled.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &CycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.moved_to_broker
            .fetch_add(report.moved_to_broker as u64, Ordering::Relaxed);
        self.executed_inline
            .fetch_add(report.executed_inline as u64, Ordering::Relaxed);
        self.dead_lettered
            .fetch_add(report.dead_lettered as u64, Ordering::Relaxed);
        self.settled
            .fetch_add(report.settled as u64, Ordering::Relaxed);
        self.errors.fetch_add(report.failed as u64, Ordering::Relaxed);
        if report.failed == 0 {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    fn record_cycle_failure(&self) -> u64 {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct SpoolDrainer {
    spool: Arc<dyn JobSpool>,
    broker: Arc<dyn Broker>,
    queue: Arc<ReliableJobQueue>,
    executor: JobExecutor,
    config: DrainerConfig,
    counters: Arc<DrainerCounters>,
}

impl SpoolDrainer {
    pub fn new(
        spool: Arc<dyn JobSpool>,
        broker: Arc<dyn Broker>,
        queue: Arc<ReliableJobQueue>,
        executor: JobExecutor,
        config: DrainerConfig,
    ) -> Self {
        Self {
            spool,
            broker,
            queue,
            executor,
            config,
            counters: Arc::new(DrainerCounters::default()),
        }
    }

    /// Shared counters, readable while the loop runs.
    pub fn counters(&self) -> Arc<DrainerCounters> {
        self.counters.clone()
    }

    /// Liveness probe that never errors.
    pub async fn probe_broker(&self) -> BrokerHealth {
        match tokio::time::timeout(self.config.broker_timeout, self.broker.ping()).await {
            Ok(Ok(())) => BrokerHealth::Healthy,
            Ok(Err(e)) => {
                debug!(error = %e, "broker ping failed");
                BrokerHealth::Degraded
            }
            Err(_) => {
                debug!("broker ping timed out");
                BrokerHealth::Degraded
            }
        }
    }

    /// One drain cycle. Errors are cycle-level (the spool could not be read).
    pub async fn drain_once(&self) -> Result<CycleReport> {
        let health = self.probe_broker().await;
        let batch = self.spool.get_next_jobs(self.config.batch_size).await?;
        let mut report = CycleReport::new(health, batch.len());

        for job in batch {
            match health {
                BrokerHealth::Healthy => self.hand_off(&job, &mut report).await,
                BrokerHealth::Degraded => self.execute_inline(&job, &mut report).await,
            }
        }

        if report.claimed > 0 {
            info!(
                health = ?report.health,
                claimed = report.claimed,
                moved_to_broker = report.moved_to_broker,
                executed_inline = report.executed_inline,
                dead_lettered = report.dead_lettered,
                settled = report.settled,
                deferred = report.deferred,
                failed = report.failed,
                "spool drain cycle finished"
            );
        }

        Ok(report)
    }

    async fn hand_off(&self, job: &SpooledJob, report: &mut CycleReport) {
        let current = match self.queue.ledger().get_job(job.job_id).await {
            Ok(Some(current)) => current,
            Ok(None) => return self.dead_letter_orphan(job, report).await,
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "ledger lookup failed; leaving job spooled");
                return self.release_failed(job, report).await;
            }
        };
        if current.status.is_terminal() {
            return self.drop_settled(job, report).await;
        }

        let envelope = BrokerJob::from_spooled(job);
        let enqueued = tokio::time::timeout(self.config.broker_timeout, self.broker.enqueue(&envelope)).await;
        match enqueued {
            Ok(Ok(())) => {
                self.remove(job, report).await;
                report.moved_to_broker += 1;
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.job_id, error = %e, "broker enqueue failed; leaving job spooled");
                self.release_failed(job, report).await;
            }
            Err(_) => {
                warn!(job_id = %job.job_id, "broker enqueue timed out; leaving job spooled");
                self.release_failed(job, report).await;
            }
        }
    }

    async fn execute_inline(&self, job: &SpooledJob, report: &mut CycleReport) {
        let claimed = match self.queue.claim(job.job_id).await {
            Ok(JobClaim::Claimed(claimed)) => claimed,
            Ok(JobClaim::Missing) => return self.dead_letter_orphan(job, report).await,
            Ok(JobClaim::Settled(_)) => return self.drop_settled(job, report).await,
            Ok(JobClaim::Unavailable(current)) => {
                debug!(job_id = %job.job_id, status = %current.status, "spooled job not claimable yet");
                self.release(job).await;
                report.deferred += 1;
                return;
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "ledger claim failed; leaving job spooled");
                return self.release_failed(job, report).await;
            }
        };

        let outcome = self.executor.execute_job(&claimed).await;
        match self.queue.record_outcome(&claimed, outcome).await {
            Ok(JobDisposition::Completed) => {
                self.remove(job, report).await;
                report.executed_inline += 1;
                debug!(job_id = %job.job_id, job_type = %job.job_type, "spooled job executed inline");
            }
            Ok(JobDisposition::DeadLettered { .. }) => {
                self.remove(job, report).await;
                report.dead_lettered += 1;
            }
            Ok(JobDisposition::Retrying { retry_at }) => {
                warn!(
                    job_id = %job.job_id,
                    job_type = %job.job_type,
                    attempt = claimed.attempts,
                    retry_at = %retry_at,
                    "inline execution failed; leaving job spooled"
                );
                self.release_failed(job, report).await;
            }
            Err(e) => {
                // The ledger row stays PROCESSING until the reaper requeues it
                error!(job_id = %job.job_id, error = %e, "failed to record inline outcome");
                self.release_failed(job, report).await;
            }
        }
    }

    async fn dead_letter_orphan(&self, job: &SpooledJob, report: &mut CycleReport) {
        let error = if job.job_data.is_none() {
            "malformed spooled payload"
        } else {
            "spooled job has no ledger row"
        };

        match self.queue.dead_letter_orphan(spool_dead_letter(job, error)).await {
            Ok(_) => {
                self.remove(job, report).await;
                report.dead_lettered += 1;
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "failed to dead-letter spooled job");
                self.release_failed(job, report).await;
            }
        }
    }

    async fn drop_settled(&self, job: &SpooledJob, report: &mut CycleReport) {
        debug!(job_id = %job.job_id, "ledger job already settled; dropping spooled copy");
        self.remove(job, report).await;
        report.settled += 1;
    }

    async fn remove(&self, job: &SpooledJob, report: &mut CycleReport) {
        match self.spool.remove_job(job.job_id, job.tenant_id.as_deref()).await {
            Ok(true) => {}
            Ok(false) => debug!(job_id = %job.job_id, "spooled job already removed"),
            Err(e) => {
                // Stays claimed until the reaper unclaims it
                error!(job_id = %job.job_id, error = %e, "failed to remove spooled job");
                report.failed += 1;
            }
        }
    }

    async fn release(&self, job: &SpooledJob) {
        if let Err(e) = self.spool.release_job(job.job_id).await {
            error!(job_id = %job.job_id, error = %e, "failed to release spooled job");
        }
    }

    async fn release_failed(&self, job: &SpooledJob, report: &mut CycleReport) {
        self.release(job).await;
        report.failed += 1;
    }

    /// Delay before the next cycle.
    pub fn next_delay(&self, health: BrokerHealth, consecutive_failures: u64) -> Duration {
        let base = match health {
            BrokerHealth::Healthy => self.config.healthy_interval,
            BrokerHealth::Degraded => self.config.degraded_interval,
        };
        if consecutive_failures == 0 {
            return base;
        }
        let factor = 1u32 << consecutive_failures.min(16);
        base.checked_mul(factor)
            .unwrap_or(self.config.max_backoff)
            .min(self.config.max_backoff)
    }

    /// Run one cycle, update counters and return the delay until the next.
    pub async fn run_cycle(&self) -> Duration {
        match self.drain_once().await {
            Ok(report) => {
                self.counters.record(&report);
                let failures = self.counters.consecutive_failures.load(Ordering::Relaxed);
                self.next_delay(report.health, failures)
            }
            Err(e) => {
                let failures = self.counters.record_cycle_failure();
                let delay = self.next_delay(BrokerHealth::Degraded, failures);
                error!(
                    error = %e,
                    consecutive_failures = failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "spool drain cycle failed"
                );
                delay
            }
        }
    }

    /// Run until `shutdown` is cancelled. A cycle in flight always finishes.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            healthy_interval_ms = self.config.healthy_interval.as_millis() as u64,
            degraded_interval_ms = self.config.degraded_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "spool drainer starting"
        );

        while !shutdown.is_cancelled() {
            let delay = self.run_cycle().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(stats = ?self.counters.snapshot(), "spool drainer stopped");
        Ok(())
    }
}

fn spool_dead_letter(job: &SpooledJob, error: &str) -> NewDeadLetterEntry {
    NewDeadLetterEntry {
        original_job_id: job.job_id,
        job_type: job.job_type.clone(),
        payload: job.job_data.clone().unwrap_or(Value::Null),
        priority: job.priority,
        last_error: error.to_string(),
        error_history: vec![error.to_string()],
        attempts: job.attempts,
        requires_manual_review: requires_manual_review(job.priority, error),
    }
}
