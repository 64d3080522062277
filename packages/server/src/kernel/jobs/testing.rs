//! In-memory implementations of the queue's stores for tests.
//!
//! Each mirrors the semantics of its Postgres counterpart closely enough
//! that reliability, drainer, runner and reaper logic can be exercised
//! without infrastructure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::dead_letter::{
    DeadLetterEntry, DeadLetterStore, NewDeadLetterEntry, ReviewDecision, ReviewUpdate,
};
use super::error::JobError;
use super::job::{
    ClaimFilter, EnqueueResult, FailOutcome, Job, JobPriority, JobStats, JobStatus, NewJob,
    RetryPolicy,
};
use super::ledger::{cutoff, stalled_error, JobLedger, StalledSweep};
use super::spool::{JobSpool, SpoolRequest, SpoolStats, SpooledJob};
use crate::kernel::broker::{Broker, BrokerDelivery, BrokerJob};
use crate::kernel::tenant::{TenantIsolation, TenantSession};

fn age(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero())
}

// ============================================================================
// Ledger
// ============================================================================

pub struct MemoryJobLedger {
    jobs: RwLock<Vec<Job>>,
    dead_letters: Arc<MemoryDeadLetterStore>,
    retry_policy: RetryPolicy,
    fail_promotions: AtomicUsize,
}

impl MemoryJobLedger {
    pub fn new(dead_letters: Arc<MemoryDeadLetterStore>) -> Self {
        Self {
            jobs: RwLock::new(Vec::new()),
            dead_letters,
            retry_policy: RetryPolicy::default(),
            fail_promotions: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` calls to `move_to_dead_letter` fail before
    /// touching the job.
    pub fn fail_next_promotions(&self, count: usize) {
        self.fail_promotions.store(count, Ordering::SeqCst);
    }

    /// Retries become due immediately.
    pub fn with_zero_backoff(mut self) -> Self {
        self.retry_policy = RetryPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Pretend a claimed job started `by` earlier than it did.
    pub fn backdate_started(&self, id: Uuid, by: Duration) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.started_at = job.started_at.map(|t| t - age(by));
        }
    }

    fn with_job<T>(&self, id: Uuid, f: impl FnOnce(&mut Job) -> Result<T>) -> Result<T> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(JobError::NotFound(id))?;
        f(job)
    }
}

#[async_trait]
impl JobLedger for MemoryJobLedger {
    async fn add_job(&self, job: NewJob) -> Result<Job> {
        job.validate()?;
        let row = Job::from_new(job);
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(row.clone());
        Ok(row)
    }

    async fn add_job_idempotent(&self, job: NewJob, dedup_window: Duration) -> Result<EnqueueResult> {
        job.validate()?;
        let row = Job::from_new(job);
        let since = cutoff(dedup_window);

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let existing = jobs
            .iter()
            .filter(|j| j.idempotency_key == row.idempotency_key && j.created_at >= since)
            .max_by_key(|j| j.created_at);
        if let Some(existing) = existing {
            return Ok(EnqueueResult::Duplicate(existing.clone()));
        }

        jobs.push(row.clone());
        Ok(EnqueueResult::Created(row))
    }

    async fn find_by_idempotency_key(&self, key: &str, since: DateTime<Utc>) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|j| j.idempotency_key == key && j.created_at >= since)
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }

    async fn get_next_job(&self, filter: &ClaimFilter) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        for job in jobs.iter_mut() {
            if job.status == JobStatus::Retrying && job.scheduled_at <= now {
                job.status = JobStatus::Pending;
                job.updated_at = now;
            }
        }

        // Vec position breaks created_at ties, matching insertion order
        let next = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.is_ready(now) && filter.matches(&j.job_type))
            .min_by_key(|(idx, j)| (j.priority, j.created_at, *idx))
            .map(|(idx, _)| idx);

        Ok(next.map(|idx| {
            let job = &mut jobs[idx];
            job.status = JobStatus::Processing;
            job.attempts += 1;
            job.started_at = Some(now);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn claim_job(&self, id: Uuid) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            return Ok(None);
        };

        let claimable = matches!(job.status, JobStatus::Pending | JobStatus::Retrying)
            && job.scheduled_at <= now
            && job.attempts < job.max_attempts;
        if !claimable {
            return Ok(None);
        }

        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, id: Uuid, result: Option<Value>) -> Result<()> {
        self.with_job(id, |job| {
            if job.status != JobStatus::Processing {
                bail!("cannot complete job {}: status is {}", id, job.status);
            }
            let now = Utc::now();
            job.status = JobStatus::Completed;
            job.result = result;
            job.completed_at = Some(now);
            job.updated_at = now;
            Ok(())
        })
    }

    async fn fail_job(&self, id: Uuid, error: &str, can_retry: bool) -> Result<FailOutcome> {
        let policy = self.retry_policy;
        self.with_job(id, |job| {
            if job.status != JobStatus::Processing {
                bail!("cannot fail job {}: status is {}", id, job.status);
            }
            let now = Utc::now();
            job.last_error = Some(error.to_string());
            job.error_history.push(error.to_string());
            job.updated_at = now;

            if can_retry && job.has_attempts_left() {
                let retry_at = policy.retry_at(job.attempts, now);
                job.status = JobStatus::Retrying;
                job.scheduled_at = retry_at;
                Ok(FailOutcome::Retrying { retry_at })
            } else {
                job.status = JobStatus::Failed;
                job.failed_at = Some(now);
                Ok(FailOutcome::Failed)
            }
        })
    }

    async fn move_to_dead_letter(&self, entry: NewDeadLetterEntry) -> Result<Option<DeadLetterEntry>> {
        let injected = self
            .fail_promotions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            bail!("dead letter promotion interrupted");
        }

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.iter_mut().find(|j| j.id == entry.original_job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Failed {
            return Ok(None);
        }

        let now = Utc::now();
        job.status = JobStatus::Dlq;
        job.dlq_at = Some(now);
        job.updated_at = now;

        Ok(Some(self.dead_letters.insert(entry)))
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn get_stats(&self, window: Duration) -> Result<JobStats> {
        let since = cutoff(window);
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut stats = JobStats {
            since: Some(since),
            ..Default::default()
        };

        let mut latencies = Vec::new();
        for job in jobs.iter().filter(|j| j.created_at >= since) {
            stats.total += 1;
            *stats.by_status.entry(job.status.to_string()).or_default() += 1;
            *stats.by_type.entry(job.job_type.clone()).or_default() += 1;
            *stats.by_priority.entry(job.priority.to_string()).or_default() += 1;
            if let (JobStatus::Completed, Some(started), Some(completed)) =
                (job.status, job.started_at, job.completed_at)
            {
                latencies.push((completed - started).num_milliseconds() as f64);
            }
        }
        if !latencies.is_empty() {
            stats.avg_processing_ms = Some(latencies.iter().sum::<f64>() / latencies.len() as f64);
        }

        Ok(stats)
    }

    async fn retry_failed(&self, job_type: Option<&str>) -> Result<u64> {
        let now = Utc::now();
        let mut count = 0;
        for job in self.jobs.write().unwrap_or_else(|e| e.into_inner()).iter_mut() {
            if job.status == JobStatus::Failed && job_type.map_or(true, |t| job.job_type == t) {
                job.status = JobStatus::Pending;
                job.attempts = 0;
                job.scheduled_at = now;
                job.failed_at = None;
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn purge_failed(&self, older_than: Duration) -> Result<u64> {
        let before = cutoff(older_than);
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let len = jobs.len();
        jobs.retain(|j| !(j.status == JobStatus::Failed && j.failed_at.is_some_and(|t| t < before)));
        Ok((len - jobs.len()) as u64)
    }

    async fn requeue_stalled(&self, stalled_for: Duration) -> Result<StalledSweep> {
        let before = cutoff(stalled_for);
        let error = stalled_error(stalled_for);
        let now = Utc::now();
        let mut sweep = StalledSweep::default();

        for job in self.jobs.write().unwrap_or_else(|e| e.into_inner()).iter_mut() {
            let stalled = job.status == JobStatus::Processing
                && job.started_at.is_some_and(|t| t < before);
            if !stalled {
                continue;
            }
            job.last_error = Some(error.clone());
            job.error_history.push(error.clone());
            job.updated_at = now;
            if job.has_attempts_left() {
                job.status = JobStatus::Pending;
                job.started_at = None;
                sweep.requeued += 1;
            } else {
                job.status = JobStatus::Failed;
                job.failed_at = Some(now);
                sweep.exhausted.push(job.clone());
            }
        }

        Ok(sweep)
    }

    async fn failed_without_dead_letter(&self, limit: i64) -> Result<Vec<Job>> {
        let promoted: Vec<Uuid> = self
            .dead_letters
            .entries()
            .iter()
            .map(|e| e.original_job_id)
            .collect();
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|j| j.status == JobStatus::Failed && !promoted.contains(&j.id))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.failed_at);
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }
}

// ============================================================================
// Dead letters
// ============================================================================

#[derive(Default)]
pub struct MemoryDeadLetterStore {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl MemoryDeadLetterStore {
    /// Insert unless an entry exists for the same original job.
    pub fn insert(&self, entry: NewDeadLetterEntry) -> DeadLetterEntry {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = entries
            .iter()
            .find(|e| e.original_job_id == entry.original_job_id)
        {
            return existing.clone();
        }
        let stored = entry.into_entry();
        entries.push(stored.clone());
        stored
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn record(&self, entry: NewDeadLetterEntry) -> Result<DeadLetterEntry> {
        Ok(self.insert(entry))
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        Ok(self.entries().into_iter().find(|e| e.id == id))
    }

    async fn find_by_original_job(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        Ok(self
            .entries()
            .into_iter()
            .find(|e| e.original_job_id == job_id))
    }

    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        let mut entries = self.entries();
        entries.reverse();
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn list_pending_review(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        let mut entries: Vec<DeadLetterEntry> =
            self.entries().into_iter().filter(|e| !e.reviewed).collect();
        entries.sort_by_key(|e| (!e.requires_manual_review, e.created_at));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn count_pending_review(&self) -> Result<i64> {
        Ok(self.entries().iter().filter(|e| !e.reviewed).count() as i64)
    }

    async fn mark_reviewed(&self, id: Uuid, decision: ReviewDecision) -> Result<Option<ReviewUpdate>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            return Ok(None);
        };
        if entry.reviewed {
            return Ok(Some(ReviewUpdate::AlreadyReviewed(entry.clone())));
        }

        entry.reviewed = true;
        entry.reviewed_by = Some(decision.reviewed_by);
        entry.reviewed_at = Some(Utc::now());
        entry.review_notes = decision.notes;
        entry.review_action = Some(decision.action);
        entry.retried_job_id = decision.retried_job_id;
        Ok(Some(ReviewUpdate::Applied(entry.clone())))
    }
}

// ============================================================================
// Spool
// ============================================================================

#[derive(Default)]
pub struct MemorySpool {
    rows: RwLock<Vec<SpooledJob>>,
    fail_reads: AtomicBool,
}

impl MemorySpool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a row with raw (possibly malformed) job data.
    pub fn insert_raw(&self, job_id: Uuid, job_type: &str, tenant_id: Option<&str>, raw: &str) {
        let now = Utc::now();
        let job = SpooledJob {
            id: Uuid::now_v7(),
            job_id,
            job_type: job_type.to_string(),
            job_data: SpooledJob::parse_job_data(job_id, job_type, tenant_id, raw),
            priority: Default::default(),
            tenant_id: tenant_id.map(str::to_string),
            attempts: 0,
            max_attempts: super::job::DEFAULT_MAX_ATTEMPTS,
            scheduled_at: now,
            processed_at: None,
            created_at: now,
        };
        self.rows.write().unwrap_or_else(|e| e.into_inner()).push(job);
    }

    /// Make `get_next_jobs` fail, simulating a datastore outage.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<SpooledJob> {
        self.rows.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn backdate_claim(&self, job_id: Uuid, by: Duration) {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        if let Some(row) = rows.iter_mut().find(|r| r.job_id == job_id) {
            row.processed_at = row.processed_at.map(|t| t - age(by));
        }
    }
}

#[async_trait]
impl JobSpool for MemorySpool {
    async fn spool_job(&self, request: SpoolRequest) -> Result<SpooledJob> {
        let now = Utc::now();
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let scheduled_at = request.scheduled_at.unwrap_or(now);

        if let Some(row) = rows.iter_mut().find(|r| r.job_id == request.job_id) {
            row.job_type = request.job_type;
            row.job_data = Some(request.payload);
            row.priority = request.priority;
            row.tenant_id = request.tenant_id;
            row.attempts = request.attempts;
            row.max_attempts = request.max_attempts;
            row.scheduled_at = scheduled_at;
            row.processed_at = None;
            return Ok(row.clone());
        }

        let row = SpooledJob {
            id: Uuid::now_v7(),
            job_id: request.job_id,
            job_type: request.job_type,
            job_data: Some(request.payload),
            priority: request.priority,
            tenant_id: request.tenant_id,
            attempts: request.attempts,
            max_attempts: request.max_attempts,
            scheduled_at,
            processed_at: None,
            created_at: now,
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn get_next_jobs(&self, limit: i64) -> Result<Vec<SpooledJob>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("spool unavailable"));
        }
        let now = Utc::now();
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());

        let mut due: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.processed_at.is_none() && r.scheduled_at <= now)
            .map(|(idx, _)| idx)
            .collect();
        due.sort_by_key(|&idx| (rows[idx].priority, rows[idx].created_at, idx));
        due.truncate(limit.max(0) as usize);

        Ok(due
            .into_iter()
            .map(|idx| {
                rows[idx].processed_at = Some(now);
                rows[idx].clone()
            })
            .collect())
    }

    async fn remove_job(&self, job_id: Uuid, tenant_id: Option<&str>) -> Result<bool> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let len = rows.len();
        rows.retain(|r| {
            !(r.job_id == job_id && tenant_id.map_or(true, |t| r.tenant_id.as_deref() == Some(t)))
        });
        Ok(rows.len() < len)
    }

    async fn release_job(&self, job_id: Uuid) -> Result<bool> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        match rows
            .iter_mut()
            .find(|r| r.job_id == job_id && r.processed_at.is_some())
        {
            Some(row) => {
                row.processed_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn requeue_stalled(&self, claimed_for: Duration) -> Result<u64> {
        let before = cutoff(claimed_for);
        let mut count = 0;
        for row in self.rows.write().unwrap_or_else(|e| e.into_inner()).iter_mut() {
            if row.processed_at.is_some_and(|t| t < before) {
                row.processed_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cleanup_processed_jobs(&self, older_than_hours: i64) -> Result<u64> {
        let before = cutoff(Duration::from_secs((older_than_hours.max(0) as u64).saturating_mul(3600)));
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let len = rows.len();
        rows.retain(|r| !r.processed_at.is_some_and(|t| t < before));
        Ok((len - rows.len()) as u64)
    }

    async fn get_spool_stats(&self) -> Result<SpoolStats> {
        let rows = self.rows();
        let mut stats = SpoolStats {
            total: rows.len() as i64,
            ..Default::default()
        };
        for row in rows.iter().filter(|r| r.processed_at.is_none()) {
            stats.pending += 1;
            *stats
                .pending_by_priority
                .entry(row.priority.to_string())
                .or_default() += 1;
            stats.oldest_pending_at = Some(
                stats
                    .oldest_pending_at
                    .map_or(row.created_at, |t| t.min(row.created_at)),
            );
        }
        stats.claimed = stats.total - stats.pending;
        Ok(stats)
    }

    async fn pending_count(&self) -> Result<i64> {
        Ok(self
            .rows()
            .iter()
            .filter(|r| r.processed_at.is_none())
            .count() as i64)
    }
}

// ============================================================================
// Broker
// ============================================================================

/// In-memory broker with switchable health. Messages are stored as JSON
/// text, as Redis stores them.
pub struct TestBroker {
    queue: RwLock<Vec<(JobPriority, String)>>,
    healthy: AtomicBool,
    fail_enqueue: AtomicBool,
    pings: AtomicUsize,
}

impl Default for TestBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBroker {
    pub fn new() -> Self {
        Self {
            queue: RwLock::new(Vec::new()),
            healthy: AtomicBool::new(true),
            fail_enqueue: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
        }
    }

    /// An unhealthy broker fails every operation.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Answer pings but reject enqueues.
    pub fn set_fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    /// Push a message body as-is, bypassing serialization.
    pub fn push_raw(&self, priority: JobPriority, body: &str) {
        self.queue
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((priority, body.to_string()));
    }

    pub fn len(&self) -> usize {
        self.queue.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued envelopes in push order; undecodable bodies are skipped.
    pub fn jobs(&self) -> Vec<BrokerJob> {
        self.queue
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|(_, body)| serde_json::from_str(body).ok())
            .collect()
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobError::BrokerUnavailable("connection refused".into()).into())
        }
    }
}

#[async_trait]
impl Broker for TestBroker {
    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    async fn enqueue(&self, job: &BrokerJob) -> Result<()> {
        self.check()?;
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(JobError::BrokerUnavailable("enqueue rejected".into()).into());
        }
        let body = serde_json::to_string(job)?;
        self.push_raw(job.priority, &body);
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<BrokerDelivery>> {
        self.check()?;
        let mut queue = self.queue.write().unwrap_or_else(|e| e.into_inner());
        let next = queue
            .iter()
            .enumerate()
            .min_by_key(|(idx, (priority, _))| (*priority, *idx))
            .map(|(idx, _)| idx);
        let Some(idx) = next else {
            return Ok(None);
        };

        let (priority, body) = queue.remove(idx);
        Ok(Some(BrokerDelivery::decode(priority.as_str(), priority, body)))
    }
}

// ============================================================================
// Tenant isolation
// ============================================================================

/// Records every session it establishes and releases.
#[derive(Default)]
pub struct RecordingTenantIsolation {
    established: RwLock<Vec<String>>,
    released: RwLock<Vec<String>>,
}

impl RecordingTenantIsolation {
    pub fn established(&self) -> Vec<String> {
        self.established
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl TenantIsolation for RecordingTenantIsolation {
    async fn establish(&self, tenant_id: &str) -> Result<TenantSession> {
        self.established
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(tenant_id.to_string());
        Ok(TenantSession::new(tenant_id))
    }

    async fn release(&self, session: TenantSession) {
        self.released
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(session.tenant_id().to_string());
    }
}

/// Isolation backend that is always down.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingTenantIsolation;

#[async_trait]
impl TenantIsolation for FailingTenantIsolation {
    async fn establish(&self, _tenant_id: &str) -> Result<TenantSession> {
        Err(anyhow!("tenant isolation backend unavailable"))
    }

    async fn release(&self, _session: TenantSession) {}
}
