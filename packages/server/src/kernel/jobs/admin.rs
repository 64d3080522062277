//! Operational surface over the queue: inspection, bulk fixes, DLQ review
//! and dashboard statistics.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::dead_letter::{DeadLetterEntry, ReviewAction};
use super::drainer::{DrainerCounters, DrainerStats};
use super::job::{Job, JobStatus};
use super::reliability::{QueueStats, ReliableJobQueue, ReviewOutcome};
use super::spool::{JobSpool, SpoolStats, DEFAULT_FALLBACK_THRESHOLD};

/// Snapshot for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub generated_at: DateTime<Utc>,
    pub queue: QueueStats,
    pub spool: SpoolStats,
    /// Spool backlog above the alerting threshold
    pub fallback_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drainer: Option<DrainerStats>,
}

pub struct JobAdmin {
    queue: Arc<ReliableJobQueue>,
    spool: Arc<dyn JobSpool>,
    drainer: Option<Arc<DrainerCounters>>,
    fallback_threshold: i64,
}

impl JobAdmin {
    pub fn new(queue: Arc<ReliableJobQueue>, spool: Arc<dyn JobSpool>) -> Self {
        Self {
            queue,
            spool,
            drainer: None,
            fallback_threshold: DEFAULT_FALLBACK_THRESHOLD,
        }
    }

    pub fn with_drainer(mut self, counters: Arc<DrainerCounters>) -> Self {
        self.drainer = Some(counters);
        self
    }

    pub fn with_fallback_threshold(mut self, threshold: i64) -> Self {
        self.fallback_threshold = threshold;
        self
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        self.queue.ledger().list_jobs(status, limit).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.queue.ledger().get_job(id).await
    }

    pub async fn retry_failed(&self, job_type: Option<&str>) -> Result<u64> {
        let count = self.queue.ledger().retry_failed(job_type).await?;
        info!(count, job_type = ?job_type, "failed jobs reset to pending");
        Ok(count)
    }

    pub async fn purge_failed(&self, older_than: Duration) -> Result<u64> {
        let count = self.queue.ledger().purge_failed(older_than).await?;
        info!(count, older_than_secs = older_than.as_secs(), "failed jobs purged");
        Ok(count)
    }

    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        self.queue.dead_letters().list(limit).await
    }

    pub async fn pending_reviews(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        self.queue.dead_letters().list_pending_review(limit).await
    }

    pub async fn review(
        &self,
        entry_id: Uuid,
        action: ReviewAction,
        reviewed_by: &str,
        notes: Option<String>,
    ) -> Result<ReviewOutcome> {
        self.queue
            .review_dead_letter(entry_id, action, reviewed_by, notes)
            .await
    }

    pub async fn spool_stats(&self) -> Result<SpoolStats> {
        self.spool.get_spool_stats().await
    }

    pub async fn cleanup_spool(&self, older_than_hours: i64) -> Result<u64> {
        let count = self.spool.cleanup_processed_jobs(older_than_hours).await?;
        info!(count, older_than_hours, "processed spool rows cleaned up");
        Ok(count)
    }

    pub async fn dashboard(&self, window: Duration) -> Result<DashboardStats> {
        Ok(DashboardStats {
            generated_at: Utc::now(),
            queue: self.queue.stats(window).await?,
            spool: self.spool.get_spool_stats().await?,
            fallback_active: self
                .spool
                .should_activate_fallback(self.fallback_threshold)
                .await?,
            drainer: self.drainer.as_ref().map(|c| c.snapshot()),
        })
    }
}
