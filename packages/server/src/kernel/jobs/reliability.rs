//! Reliability layer over the job ledger.
//!
//! Adds three policies to raw ledger access:
//! - idempotent submission (duplicates inside the dedup window collapse onto
//!   the existing job)
//! - per-type circuit breakers that defer polling for a failing type
//! - dead-letter routing once a job is out of attempts or asks for it
//!
//! ```text
//! submit ─► JobLedger::add_job_idempotent
//! poll   ─► CircuitBreakers ─► JobLedger::get_next_job
//! claim  ─► CircuitBreakers ─► JobLedger::claim_job      (broker, spool)
//! record ─► complete | fail_job ─► (Failed) move_to_dead_letter
//! ```
//!
//! Every transport settles through `record_outcome`, so breakers and dead
//! letter routing behave the same whichever path delivered the job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::circuit_breaker::{CircuitBreakerConfig, CircuitBreakers, CircuitSnapshot};
use super::dead_letter::{
    DeadLetterEntry, DeadLetterStore, NewDeadLetterEntry, ReviewAction, ReviewDecision,
    ReviewUpdate,
};
use super::error::JobError;
use super::executor::JobExecutor;
use super::job::{
    ClaimFilter, EnqueueResult, FailOutcome, Job, JobPriority, JobStats, NewJob, SubmitOptions,
    DEFAULT_MAX_ATTEMPTS,
};
use super::ledger::JobLedger;
use super::payload::JobPayload;
use super::registry::JobOutcome;

#[derive(Debug, Clone, Copy)]
pub struct ReliabilityConfig {
    /// Window in which a repeated idempotency key returns the existing job
    pub dedup_window: Duration,
    pub default_max_attempts: i32,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(300),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Where a job ended up after its outcome was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum JobDisposition {
    Completed,
    Retrying { retry_at: DateTime<Utc> },
    /// `entry_id` is `None` if another caller already dead-lettered the job
    DeadLettered { entry_id: Option<Uuid> },
}

/// Result of claiming one job by id.
#[derive(Debug, Clone)]
pub enum JobClaim {
    /// Now PROCESSING and owned by the caller
    Claimed(Job),
    /// Running elsewhere, retry not yet due, or its type's circuit is open
    Unavailable(Job),
    /// COMPLETED, FAILED or DLQ
    Settled(Job),
    /// No ledger row
    Missing,
}

/// A job that `process_next` claimed and settled.
#[derive(Debug, Clone)]
pub struct ProcessedJob {
    pub job_id: Uuid,
    pub job_type: String,
    pub disposition: JobDisposition,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub entry: DeadLetterEntry,
    /// False when the entry had already been reviewed
    pub applied: bool,
    /// Fresh job created by a retry review
    pub retried_job: Option<Job>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub ledger: JobStats,
    pub circuit_breakers: Vec<CircuitSnapshot>,
    pub pending_reviews: i64,
}

pub struct ReliableJobQueue {
    ledger: Arc<dyn JobLedger>,
    dead_letters: Arc<dyn DeadLetterStore>,
    breakers: CircuitBreakers,
    config: ReliabilityConfig,
}

impl ReliableJobQueue {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        dead_letters: Arc<dyn DeadLetterStore>,
        config: ReliabilityConfig,
    ) -> Self {
        Self {
            ledger,
            dead_letters,
            breakers: CircuitBreakers::new(config.circuit_breaker),
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.ledger
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterStore> {
        &self.dead_letters
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a typed job. A repeat submission inside the dedup window
    /// returns the existing job as `EnqueueResult::Duplicate`.
    pub async fn submit(&self, payload: JobPayload, options: SubmitOptions) -> Result<EnqueueResult> {
        payload.validate()?;

        let job_type = payload.job_type().to_string();
        let new_job = NewJob {
            payload: payload.to_value()?,
            job_type,
            priority: options.priority.unwrap_or_default(),
            max_attempts: options
                .max_attempts
                .unwrap_or(self.config.default_max_attempts),
            scheduled_at: options.scheduled_at,
            idempotency_key: options.idempotency_key,
        };

        let result = self
            .ledger
            .add_job_idempotent(new_job, self.config.dedup_window)
            .await?;

        match &result {
            EnqueueResult::Created(job) => debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                priority = %job.priority,
                "job submitted"
            ),
            EnqueueResult::Duplicate(job) => info!(
                job_id = %job.id,
                job_type = %job.job_type,
                idempotency_key = %job.idempotency_key,
                "duplicate submission returned existing job"
            ),
        }

        Ok(result)
    }

    /// Submit from an untyped `(type, payload)` pair, validating at the boundary.
    pub async fn submit_raw(
        &self,
        job_type: &str,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<EnqueueResult> {
        let payload = JobPayload::from_parts(job_type, payload)?;
        self.submit(payload, options).await
    }

    // =========================================================================
    // Consumption
    // =========================================================================

    /// Claim the next job, honouring open circuit breakers.
    ///
    /// Polling for a type whose breaker is open yields `None` without touching
    /// the ledger. An untyped poll skips every type with an open breaker.
    pub async fn poll(&self, job_type: Option<&str>) -> Result<Option<Job>> {
        if let Some(job_type) = job_type {
            if self.breakers.is_open(job_type) {
                warn!(
                    job_type = %job_type,
                    error = %JobError::CircuitOpen(job_type.to_string()),
                    "deferring poll"
                );
                return Ok(None);
            }
        }

        let filter = ClaimFilter {
            job_type: job_type.map(str::to_string),
            exclude_types: self.breakers.open_types(),
        };
        if !filter.exclude_types.is_empty() {
            debug!(skipped = ?filter.exclude_types, "circuit open for job types");
        }

        self.ledger.get_next_job(&filter).await
    }

    /// Claim a specific job, for consumers that learn job ids from the broker
    /// or the spool rather than polling.
    pub async fn claim(&self, job_id: Uuid) -> Result<JobClaim> {
        let Some(current) = self.ledger.get_job(job_id).await? else {
            return Ok(JobClaim::Missing);
        };
        if current.status.is_terminal() {
            return Ok(JobClaim::Settled(current));
        }
        if self.breakers.is_open(&current.job_type) {
            debug!(job_id = %job_id, job_type = %current.job_type, "circuit open; claim deferred");
            return Ok(JobClaim::Unavailable(current));
        }

        match self.ledger.claim_job(job_id).await? {
            Some(job) => Ok(JobClaim::Claimed(job)),
            None => Ok(JobClaim::Unavailable(current)),
        }
    }

    /// Claim one job, run it and record the outcome.
    pub async fn process_next(
        &self,
        executor: &JobExecutor,
        job_type: Option<&str>,
    ) -> Result<Option<ProcessedJob>> {
        let Some(job) = self.poll(job_type).await? else {
            return Ok(None);
        };

        let outcome = executor.execute_job(&job).await;
        let disposition = self.record_outcome(&job, outcome).await?;

        Ok(Some(ProcessedJob {
            job_id: job.id,
            job_type: job.job_type,
            disposition,
        }))
    }

    /// Apply a handler outcome to a claimed job.
    pub async fn record_outcome(&self, job: &Job, outcome: JobOutcome) -> Result<JobDisposition> {
        match outcome {
            JobOutcome::Completed { result } => {
                self.ledger.complete_job(job.id, result).await?;
                self.breakers.record_success(&job.job_type);
                debug!(job_id = %job.id, job_type = %job.job_type, "job completed");
                Ok(JobDisposition::Completed)
            }
            JobOutcome::Retry { error } => {
                self.note_failure(job, &error);
                match self.ledger.fail_job(job.id, &error, true).await? {
                    FailOutcome::Retrying { retry_at } => {
                        debug!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempt = job.attempts,
                            retry_at = %retry_at,
                            "job scheduled for retry"
                        );
                        Ok(JobDisposition::Retrying { retry_at })
                    }
                    FailOutcome::Failed => self.dead_letter(job, &error).await,
                }
            }
            JobOutcome::DeadLetter { error } => {
                self.note_failure(job, &error);
                self.ledger.fail_job(job.id, &error, false).await?;
                self.dead_letter(job, &error).await
            }
        }
    }

    fn note_failure(&self, job: &Job, error: &str) {
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            error = %error,
            "job failed"
        );
        if self.breakers.record_failure(&job.job_type) {
            warn!(
                job_type = %job.job_type,
                threshold = self.config.circuit_breaker.failure_threshold,
                "circuit breaker opened"
            );
        }
    }

    /// Promote a FAILED job to the dead letter store.
    pub async fn dead_letter(&self, job: &Job, error: &str) -> Result<JobDisposition> {
        // The stored row carries the error history written by fail_job
        let current = self.ledger.get_job(job.id).await?;
        let entry = NewDeadLetterEntry::from_job(current.as_ref().unwrap_or(job), error);
        let stored = self.ledger.move_to_dead_letter(entry).await?;

        match &stored {
            Some(entry) => warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                dlq_entry_id = %entry.id,
                requires_manual_review = entry.requires_manual_review,
                "job moved to dead letter store"
            ),
            None => debug!(job_id = %job.id, "job already dead-lettered"),
        }

        Ok(JobDisposition::DeadLettered {
            entry_id: stored.map(|e| e.id),
        })
    }

    /// Record work that never had a ledger row: an undecodable broker message
    /// or a spool row whose job is gone.
    pub async fn dead_letter_orphan(&self, entry: NewDeadLetterEntry) -> Result<DeadLetterEntry> {
        let stored = self.dead_letters.record(entry).await?;
        warn!(
            original_job_id = %stored.original_job_id,
            job_type = %stored.job_type,
            dlq_entry_id = %stored.id,
            error = %stored.last_error,
            "orphaned work moved to dead letter store"
        );
        Ok(stored)
    }

    // =========================================================================
    // Dead letter review
    // =========================================================================

    /// Retry or discard a dead-lettered job. Reviewing an entry twice is a
    /// no-op that returns `applied = false`.
    pub async fn review_dead_letter(
        &self,
        entry_id: Uuid,
        action: ReviewAction,
        reviewed_by: &str,
        notes: Option<String>,
    ) -> Result<ReviewOutcome> {
        let entry = self
            .dead_letters
            .get(entry_id)
            .await?
            .ok_or(JobError::NotFound(entry_id))?;

        if entry.reviewed {
            debug!(dlq_entry_id = %entry_id, "dead letter entry already reviewed");
            return Ok(ReviewOutcome {
                entry,
                applied: false,
                retried_job: None,
            });
        }

        let retried_job = match action {
            ReviewAction::Retry => {
                let new_job = NewJob {
                    job_type: entry.job_type.clone(),
                    payload: entry.payload.clone(),
                    priority: JobPriority::Normal,
                    max_attempts: self.config.default_max_attempts,
                    scheduled_at: None,
                    idempotency_key: Some(format!("dlq-retry:{}", entry.id)),
                };
                let created = self
                    .ledger
                    .add_job_idempotent(new_job, self.config.dedup_window)
                    .await?;
                Some(created.into_job())
            }
            ReviewAction::Discard => None,
        };

        let decision = ReviewDecision {
            action,
            reviewed_by: reviewed_by.to_string(),
            notes,
            retried_job_id: retried_job.as_ref().map(|j| j.id),
        };

        let update = self
            .dead_letters
            .mark_reviewed(entry_id, decision)
            .await?
            .ok_or(JobError::NotFound(entry_id))?;

        let applied = update.was_applied();
        let entry = match update {
            ReviewUpdate::Applied(entry) | ReviewUpdate::AlreadyReviewed(entry) => entry,
        };

        info!(
            dlq_entry_id = %entry_id,
            action = ?action,
            reviewed_by = %reviewed_by,
            applied,
            retried_job_id = ?entry.retried_job_id,
            "dead letter entry reviewed"
        );

        Ok(ReviewOutcome {
            entry,
            applied,
            retried_job: if applied { retried_job } else { None },
        })
    }

    pub async fn stats(&self, window: Duration) -> Result<QueueStats> {
        Ok(QueueStats {
            ledger: self.ledger.get_stats(window).await?,
            circuit_breakers: self.breakers.snapshot(),
            pending_reviews: self.dead_letters.count_pending_review().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::JobStatus;
    use crate::kernel::jobs::payload::{MessageDeliveryPayload, MESSAGE_DELIVERY};
    use crate::kernel::jobs::registry::{HandlerRegistry, JobContext};
    use crate::kernel::jobs::testing::{MemoryDeadLetterStore, MemoryJobLedger};
    use crate::kernel::tenant::{NoopTenantIsolation, TenantContextWrapper};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue(threshold: u32) -> (ReliableJobQueue, Arc<MemoryJobLedger>, Arc<MemoryDeadLetterStore>) {
        let dead_letters = Arc::new(MemoryDeadLetterStore::default());
        let ledger = Arc::new(MemoryJobLedger::new(dead_letters.clone()).with_zero_backoff());
        let queue = ReliableJobQueue::new(
            ledger.clone(),
            dead_letters.clone(),
            ReliabilityConfig {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: threshold,
                    cooldown: Duration::from_secs(60),
                },
                ..Default::default()
            },
        );
        (queue, ledger, dead_letters)
    }

    fn delivery(text: &str) -> JobPayload {
        JobPayload::MessageDelivery(MessageDeliveryPayload {
            tenant_id: "t-1".into(),
            recipient_id: "r-1".into(),
            channel: "whatsapp".into(),
            text: text.into(),
            reply_to: None,
        })
    }

    fn executor_with<F>(count: Arc<AtomicUsize>, outcome: F) -> JobExecutor
    where
        F: Fn() -> JobOutcome + Send + Sync + 'static,
    {
        let outcome = Arc::new(outcome);
        let mut registry = HandlerRegistry::new();
        registry.register(MESSAGE_DELIVERY, move |_ctx: JobContext| {
            let count = count.clone();
            let outcome = outcome.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(outcome())
            }
        });
        JobExecutor::new(
            Arc::new(registry),
            TenantContextWrapper::new(Arc::new(NoopTenantIsolation)),
        )
    }

    #[tokio::test]
    async fn duplicate_submission_returns_existing_job() {
        let (queue, ledger, _) = queue(5);

        let first = queue.submit(delivery("hi"), SubmitOptions::default()).await.unwrap();
        let second = queue.submit(delivery("hi"), SubmitOptions::default()).await.unwrap();

        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.job_id(), second.job_id());
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn invalid_submission_is_rejected() {
        let (queue, ledger, _) = queue(5);
        let err = queue
            .submit_raw(MESSAGE_DELIVERY, json!({ "text": "no tenant" }), SubmitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<JobError>(), Some(JobError::Validation(_))));
        assert_eq!(ledger.len(), 0);
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered_once() {
        let (queue, ledger, dead_letters) = queue(100);
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(calls.clone(), || JobOutcome::retry("gateway timeout"));

        let job_id = queue
            .submit(delivery("retry me"), SubmitOptions::default())
            .await
            .unwrap()
            .job_id();

        let mut dispositions = Vec::new();
        while let Some(processed) = queue.process_next(&executor, None).await.unwrap() {
            dispositions.push(processed.disposition);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(dispositions[0], JobDisposition::Retrying { .. }));
        assert!(matches!(dispositions[1], JobDisposition::Retrying { .. }));
        assert!(matches!(dispositions[2], JobDisposition::DeadLettered { entry_id: Some(_) }));

        let job = ledger.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Dlq);
        assert_eq!(job.error_history.len(), 3);

        let entries = dead_letters.list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 3);
        assert_eq!(entries[0].error_history.len(), 3);

        // A second promotion attempt is a no-op
        let again = queue.dead_letter(&job, "late").await.unwrap();
        assert_eq!(again, JobDisposition::DeadLettered { entry_id: None });
        assert_eq!(dead_letters.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retry_budget() {
        let (queue, _, dead_letters) = queue(100);
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(calls.clone(), || JobOutcome::dead_letter("payment declined"));

        queue.submit(delivery("pay"), SubmitOptions::default()).await.unwrap();
        let processed = queue.process_next(&executor, None).await.unwrap().unwrap();

        assert!(matches!(processed.disposition, JobDisposition::DeadLettered { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let entry = dead_letters.list(1).await.unwrap().remove(0);
        assert!(entry.requires_manual_review);
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_defers_then_recovers() {
        let (queue, _, _) = queue(5);
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = executor_with(calls.clone(), || JobOutcome::retry("model overloaded"));

        for i in 0..6 {
            queue
                .submit(
                    delivery(&format!("m{}", i)),
                    SubmitOptions::builder().max_attempts(1).build(),
                )
                .await
                .unwrap();
        }

        for _ in 0..5 {
            assert!(queue.process_next(&failing, Some(MESSAGE_DELIVERY)).await.unwrap().is_some());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(queue.breakers().is_open(MESSAGE_DELIVERY));

        // Breaker open: poll is skipped and the handler is not invoked
        assert!(queue.process_next(&failing, Some(MESSAGE_DELIVERY)).await.unwrap().is_none());
        assert!(queue.process_next(&failing, None).await.unwrap().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        tokio::time::advance(Duration::from_secs(61)).await;

        let succeeding = executor_with(calls.clone(), JobOutcome::completed);
        let processed = queue
            .process_next(&succeeding, Some(MESSAGE_DELIVERY))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(processed.disposition, JobDisposition::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn review_retry_creates_fresh_job_and_is_idempotent() {
        let (queue, ledger, _) = queue(100);
        let executor = executor_with(Arc::new(AtomicUsize::new(0)), || {
            JobOutcome::dead_letter("bad recipient")
        });

        let original = queue
            .submit(
                delivery("x"),
                SubmitOptions::builder().priority(JobPriority::High).build(),
            )
            .await
            .unwrap()
            .job_id();
        let processed = queue.process_next(&executor, None).await.unwrap().unwrap();
        let JobDisposition::DeadLettered { entry_id: Some(entry_id) } = processed.disposition else {
            panic!("expected dead letter");
        };

        let first = queue
            .review_dead_letter(entry_id, ReviewAction::Retry, "ops@relay", Some("fixed".into()))
            .await
            .unwrap();
        assert!(first.applied);
        let retried = first.retried_job.unwrap();
        assert_ne!(retried.id, original);
        assert_eq!(retried.priority, JobPriority::Normal);
        assert_eq!(retried.attempts, 0);
        assert_eq!(first.entry.retried_job_id, Some(retried.id));

        let second = queue
            .review_dead_letter(entry_id, ReviewAction::Retry, "someone-else", None)
            .await
            .unwrap();
        assert!(!second.applied);
        assert_eq!(second.entry.reviewed_by.as_deref(), Some("ops@relay"));
        assert_eq!(ledger.len(), 2);

        let old = ledger.get_job(original).await.unwrap().unwrap();
        assert_eq!(old.status, JobStatus::Dlq);
    }

    #[tokio::test]
    async fn reviewing_unknown_entry_is_not_found() {
        let (queue, _, _) = queue(5);
        let err = queue
            .review_dead_letter(Uuid::now_v7(), ReviewAction::Discard, "ops", None)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<JobError>(), Some(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn claim_by_id_reports_why_a_job_cannot_run() {
        let (queue, _ledger, _) = queue(1);
        let job = queue
            .submit(delivery("hi"), SubmitOptions::default())
            .await
            .unwrap()
            .into_job();

        assert!(matches!(queue.claim(Uuid::now_v7()).await.unwrap(), JobClaim::Missing));

        let claimed = match queue.claim(job.id).await.unwrap() {
            JobClaim::Claimed(claimed) => claimed,
            other => panic!("expected claim, got {:?}", other),
        };
        assert_eq!(claimed.attempts, 1);
        assert!(matches!(queue.claim(job.id).await.unwrap(), JobClaim::Unavailable(_)));

        queue
            .record_outcome(&claimed, JobOutcome::completed())
            .await
            .unwrap();
        assert!(matches!(queue.claim(job.id).await.unwrap(), JobClaim::Settled(_)));
    }

    #[tokio::test]
    async fn claim_by_id_honours_open_circuit() {
        let (queue, ledger, _) = queue(1);
        let job = queue
            .submit(delivery("hi"), SubmitOptions::default())
            .await
            .unwrap()
            .into_job();
        queue.breakers().record_failure(MESSAGE_DELIVERY);

        assert!(matches!(queue.claim(job.id).await.unwrap(), JobClaim::Unavailable(_)));
        assert_eq!(
            ledger.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn orphaned_work_goes_to_the_dead_letter_store() {
        let (queue, _, dead_letters) = queue(1);
        let entry = NewDeadLetterEntry {
            original_job_id: Uuid::now_v7(),
            job_type: "broker.malformed".into(),
            payload: json!({ "body": "??" }),
            priority: JobPriority::Normal,
            last_error: "undecodable".into(),
            error_history: vec!["undecodable".into()],
            attempts: 0,
            requires_manual_review: true,
        };

        let stored = queue.dead_letter_orphan(entry).await.unwrap();

        assert_eq!(dead_letters.entries()[0].id, stored.id);
        assert!(stored.requires_manual_review);
    }
}
