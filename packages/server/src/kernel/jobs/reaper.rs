//! Stalled work reaper.
//!
//! A worker that dies mid-job leaves its ledger row in PROCESSING and its
//! spool claim set forever. The reaper periodically puts such work back:
//! ledger jobs with attempts left return to PENDING, exhausted ones are
//! failed and dead-lettered, and stale spool claims are released. It also
//! finishes promotions that were interrupted between `fail_job` and the dead
//! letter insert, so no FAILED job stays without an entry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ledger::stalled_error;
use super::reliability::ReliableJobQueue;

/// FAILED jobs promoted per sweep.
const PROMOTION_BATCH: i64 = 100;
use super::spool::JobSpool;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// PROCESSING longer than this counts as stalled
    pub stalled_job_timeout: Duration,
    /// Spool claims older than this are released
    pub spool_claim_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stalled_job_timeout: Duration::from_secs(900),
            spool_claim_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaperReport {
    pub requeued: u64,
    pub dead_lettered: u64,
    /// FAILED jobs whose promotion failed again; retried next sweep
    pub promotion_errors: u64,
    pub spool_released: u64,
}

pub struct StalledJobReaper {
    queue: Arc<ReliableJobQueue>,
    spool: Arc<dyn JobSpool>,
    config: ReaperConfig,
}

impl StalledJobReaper {
    pub fn new(queue: Arc<ReliableJobQueue>, spool: Arc<dyn JobSpool>, config: ReaperConfig) -> Self {
        Self {
            queue,
            spool,
            config,
        }
    }

    /// Run one sweep.
    pub async fn reap(&self) -> Result<ReaperReport> {
        let sweep = self
            .queue
            .ledger()
            .requeue_stalled(self.config.stalled_job_timeout)
            .await?;

        let mut report = ReaperReport {
            requeued: sweep.requeued,
            ..Default::default()
        };

        for job in &sweep.exhausted {
            warn!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "stalled job out of attempts");
        }

        // Exhausted stalled jobs are FAILED by now and show up here too
        let stranded = self
            .queue
            .ledger()
            .failed_without_dead_letter(PROMOTION_BATCH)
            .await?;
        for job in &stranded {
            let error = job
                .last_error
                .clone()
                .unwrap_or_else(|| "failed without dead letter entry".to_string());
            match self.queue.dead_letter(job, &error).await {
                Ok(_) => report.dead_lettered += 1,
                Err(e) => {
                    warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "dead letter promotion failed");
                    report.promotion_errors += 1;
                }
            }
        }

        report.spool_released = self
            .spool
            .requeue_stalled(self.config.spool_claim_timeout)
            .await?;

        Ok(report)
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(interval_secs = self.config.interval.as_secs(), "stalled job reaper starting");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            match self.reap().await {
                Ok(report) if report == ReaperReport::default() => debug!("no stalled work found"),
                Ok(report) => info!(
                    requeued = report.requeued,
                    dead_lettered = report.dead_lettered,
                    promotion_errors = report.promotion_errors,
                    spool_released = report.spool_released,
                    "reclaimed stalled work"
                ),
                Err(e) => warn!(error = %e, "stalled job sweep failed"),
            }
        }

        info!("stalled job reaper stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::dead_letter::DeadLetterStore;
    use crate::kernel::jobs::job::{ClaimFilter, JobStatus, SubmitOptions};
    use crate::kernel::jobs::ledger::JobLedger;
    use crate::kernel::jobs::registry::JobOutcome;
    use crate::kernel::jobs::reliability::ReliabilityConfig;
    use crate::kernel::jobs::spool::SpoolRequest;
    use crate::kernel::jobs::testing::{MemoryDeadLetterStore, MemoryJobLedger, MemorySpool};
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn reclaims_stalled_jobs_and_spool_claims() {
        let dead_letters = Arc::new(MemoryDeadLetterStore::default());
        let ledger = Arc::new(MemoryJobLedger::new(dead_letters.clone()));
        let spool = Arc::new(MemorySpool::new());
        let queue = Arc::new(ReliableJobQueue::new(
            ledger.clone(),
            dead_letters.clone(),
            ReliabilityConfig::default(),
        ));

        let retryable = queue
            .submit_raw("report.build", json!({ "n": 1 }), SubmitOptions::default())
            .await
            .unwrap()
            .job_id();
        let exhausted = queue
            .submit_raw(
                "report.build",
                json!({ "n": 2 }),
                SubmitOptions::builder().max_attempts(1).build(),
            )
            .await
            .unwrap()
            .job_id();
        ledger.get_next_job(&ClaimFilter::any()).await.unwrap();
        ledger.get_next_job(&ClaimFilter::any()).await.unwrap();
        ledger.backdate_started(retryable, Duration::from_secs(3600));
        ledger.backdate_started(exhausted, Duration::from_secs(3600));

        let spooled = Uuid::now_v7();
        spool
            .spool_job(SpoolRequest::new(spooled, "report.build", json!({})))
            .await
            .unwrap();
        spool.get_next_jobs(1).await.unwrap();
        spool.backdate_claim(spooled, Duration::from_secs(3600));

        let reaper = StalledJobReaper::new(queue, spool.clone(), ReaperConfig::default());
        let report = reaper.reap().await.unwrap();

        assert_eq!(
            report,
            ReaperReport {
                requeued: 1,
                dead_lettered: 1,
                promotion_errors: 0,
                spool_released: 1,
            }
        );
        assert_eq!(
            ledger.get_job(retryable).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(
            ledger.get_job(exhausted).await.unwrap().unwrap().status,
            JobStatus::Dlq
        );
        let entry = dead_letters.find_by_original_job(exhausted).await.unwrap().unwrap();
        assert!(entry.last_error.starts_with("stalled"));
        assert_eq!(spool.pending_count().await.unwrap(), 1);

        // Nothing left to reclaim
        assert_eq!(reaper.reap().await.unwrap(), ReaperReport::default());
    }

    #[tokio::test]
    async fn fresh_claims_are_left_alone() {
        let dead_letters = Arc::new(MemoryDeadLetterStore::default());
        let ledger = Arc::new(MemoryJobLedger::new(dead_letters.clone()));
        let queue = Arc::new(ReliableJobQueue::new(
            ledger.clone(),
            dead_letters,
            ReliabilityConfig::default(),
        ));
        queue
            .submit_raw("report.build", json!({}), SubmitOptions::default())
            .await
            .unwrap();
        ledger.get_next_job(&ClaimFilter::any()).await.unwrap();

        let reaper = StalledJobReaper::new(queue, Arc::new(MemorySpool::new()), ReaperConfig::default());
        assert_eq!(reaper.reap().await.unwrap(), ReaperReport::default());
    }

    fn memory_queue() -> (Arc<ReliableJobQueue>, Arc<MemoryJobLedger>, Arc<MemoryDeadLetterStore>) {
        let dead_letters = Arc::new(MemoryDeadLetterStore::default());
        let ledger = Arc::new(MemoryJobLedger::new(dead_letters.clone()));
        let queue = Arc::new(ReliableJobQueue::new(
            ledger.clone(),
            dead_letters.clone(),
            ReliabilityConfig::default(),
        ));
        (queue, ledger, dead_letters)
    }

    async fn fail_permanently(queue: &ReliableJobQueue, n: i32) -> Uuid {
        queue
            .submit_raw("report.build", json!({ "n": n }), SubmitOptions::default())
            .await
            .unwrap();
        let job = queue.poll(None).await.unwrap().unwrap();
        let _ = queue
            .record_outcome(&job, JobOutcome::dead_letter("template missing"))
            .await;
        job.id
    }

    #[tokio::test]
    async fn interrupted_promotion_is_finished_by_the_next_sweep() {
        let (queue, ledger, dead_letters) = memory_queue();
        ledger.fail_next_promotions(1);

        let submitted = queue
            .submit_raw("report.build", json!({ "n": 1 }), SubmitOptions::default())
            .await
            .unwrap()
            .job_id();
        let job = queue.poll(None).await.unwrap().unwrap();
        let interrupted = queue
            .record_outcome(&job, JobOutcome::dead_letter("template missing"))
            .await;

        assert!(interrupted.is_err());
        assert_eq!(
            ledger.get_job(submitted).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
        assert!(dead_letters.entries().is_empty());

        let reaper = StalledJobReaper::new(queue, Arc::new(MemorySpool::new()), ReaperConfig::default());
        let report = reaper.reap().await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(
            ledger.get_job(submitted).await.unwrap().unwrap().status,
            JobStatus::Dlq
        );
        let entry = dead_letters.find_by_original_job(submitted).await.unwrap().unwrap();
        assert_eq!(entry.last_error, "template missing");
    }

    #[tokio::test]
    async fn one_failed_promotion_does_not_stop_the_sweep() {
        let (queue, ledger, dead_letters) = memory_queue();
        ledger.fail_next_promotions(2);
        let first = fail_permanently(&queue, 1).await;
        let second = fail_permanently(&queue, 2).await;
        assert!(dead_letters.entries().is_empty());

        ledger.fail_next_promotions(1);
        let reaper = StalledJobReaper::new(queue, Arc::new(MemorySpool::new()), ReaperConfig::default());
        let report = reaper.reap().await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.promotion_errors, 1);

        let report = reaper.reap().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.promotion_errors, 0);
        for id in [first, second] {
            assert_eq!(ledger.get_job(id).await.unwrap().unwrap().status, JobStatus::Dlq);
        }
    }
}
