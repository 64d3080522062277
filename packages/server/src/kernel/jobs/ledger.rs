//! Priority job ledger.
//!
//! The durable record of submitted jobs and their lifecycle state. Dequeue is
//! the only contended operation; the Postgres implementation claims rows with
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never receive the same job.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::dead_letter::{self, DeadLetterEntry, NewDeadLetterEntry};
use super::error::JobError;
use super::job::{
    ClaimFilter, EnqueueResult, FailOutcome, Job, JobPriority, JobStats, JobStatus, NewJob,
    RetryPolicy,
};
use crate::common::utils::advisory_lock_id;

/// Outcome of a stalled-job sweep.
#[derive(Debug, Default)]
pub struct StalledSweep {
    /// Returned to PENDING with attempts remaining
    pub requeued: u64,
    /// Out of attempts; now FAILED and awaiting dead-letter promotion
    pub exhausted: Vec<Job>,
}

/// Trait for ledger operations.
///
/// All job state transitions go through this trait; nothing else writes to
/// the jobs table.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Insert a new PENDING job with `attempts = 0`.
    async fn add_job(&self, job: NewJob) -> Result<Job>;

    /// Insert unless a job with the same idempotency key was created within
    /// `dedup_window`; the check and insert are atomic per key.
    async fn add_job_idempotent(&self, job: NewJob, dedup_window: Duration) -> Result<EnqueueResult>;

    async fn find_by_idempotency_key(&self, key: &str, since: DateTime<Utc>) -> Result<Option<Job>>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// Claim the most urgent eligible job and flip it to PROCESSING.
    ///
    /// Ordering is priority, then creation time. Due RETRYING rows are
    /// promoted back to PENDING first.
    async fn get_next_job(&self, filter: &ClaimFilter) -> Result<Option<Job>>;

    /// Claim one specific job if it is PENDING, or RETRYING and due.
    ///
    /// `None` when the job is missing, running elsewhere, settled or not yet
    /// due. Safe against a concurrent `get_next_job` on the same row.
    async fn claim_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// PROCESSING -> COMPLETED.
    async fn complete_job(&self, id: Uuid, result: Option<Value>) -> Result<()>;

    /// PROCESSING -> RETRYING (with backoff) or FAILED.
    async fn fail_job(&self, id: Uuid, error: &str, can_retry: bool) -> Result<FailOutcome>;

    /// FAILED -> DLQ plus one dead letter entry, in a single transaction.
    ///
    /// Returns `None` when the job was not FAILED (already dead-lettered or
    /// never failed), so the promotion happens exactly once.
    async fn move_to_dead_letter(&self, entry: NewDeadLetterEntry) -> Result<Option<DeadLetterEntry>>;

    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>>;

    /// Counts by status/type/priority and mean processing latency over a
    /// trailing window.
    async fn get_stats(&self, window: Duration) -> Result<JobStats>;

    /// Reset FAILED jobs to PENDING with a fresh attempt budget.
    async fn retry_failed(&self, job_type: Option<&str>) -> Result<u64>;

    /// Delete FAILED jobs that failed before `older_than` ago.
    async fn purge_failed(&self, older_than: Duration) -> Result<u64>;

    /// Recover PROCESSING rows whose worker never reported back.
    async fn requeue_stalled(&self, stalled_for: Duration) -> Result<StalledSweep>;

    /// FAILED jobs with no dead letter entry, oldest failure first. These are
    /// jobs whose promotion was interrupted after `fail_job` committed.
    async fn failed_without_dead_letter(&self, limit: i64) -> Result<Vec<Job>>;
}

/// `now - window`, clamped to the epoch so Postgres can store it.
pub(crate) fn cutoff(window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |t| t.max(DateTime::<Utc>::UNIX_EPOCH))
}

pub(crate) fn stalled_error(stalled_for: Duration) -> String {
    format!(
        "stalled: no completion reported within {}s",
        stalled_for.as_secs()
    )
}

/// PostgreSQL-backed job ledger.
pub struct PostgresJobLedger {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl PostgresJobLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(pool: PgPool, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    async fn find_recent_by_key(
        conn: &mut PgConnection,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            WHERE idempotency_key = $1
              AND created_at >= $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(key)
        .bind(since)
        .fetch_optional(conn)
        .await?;

        Ok(job)
    }
}

async fn insert_job(conn: &mut PgConnection, job: &Job) -> Result<Job> {
    let inserted = sqlx::query_as::<_, Job>(
        r#"
        INSERT INTO jobs (
            id, job_type, payload, priority, status, attempts, max_attempts,
            scheduled_at, idempotency_key, error_history, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING *
        "#,
    )
    .bind(job.id)
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(job.priority)
    .bind(job.status)
    .bind(job.attempts)
    .bind(job.max_attempts)
    .bind(job.scheduled_at)
    .bind(&job.idempotency_key)
    .bind(&job.error_history)
    .bind(job.created_at)
    .bind(job.updated_at)
    .fetch_one(conn)
    .await?;

    Ok(inserted)
}

#[async_trait]
impl JobLedger for PostgresJobLedger {
    async fn add_job(&self, job: NewJob) -> Result<Job> {
        job.validate()?;
        let row = Job::from_new(job);

        let mut conn = self.pool.acquire().await?;
        insert_job(&mut conn, &row).await
    }

    async fn add_job_idempotent(&self, job: NewJob, dedup_window: Duration) -> Result<EnqueueResult> {
        job.validate()?;
        let row = Job::from_new(job);
        let since = cutoff(dedup_window);

        let mut tx = self.pool.begin().await?;

        // Serializes concurrent submissions of the same key until commit
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_lock_id(&row.idempotency_key))
            .execute(&mut *tx)
            .await?;

        if let Some(existing) = Self::find_recent_by_key(&mut tx, &row.idempotency_key, since).await? {
            tx.commit().await?;
            debug!(
                job_id = %existing.id,
                idempotency_key = %existing.idempotency_key,
                "duplicate submission collapsed onto existing job"
            );
            return Ok(EnqueueResult::Duplicate(existing));
        }

        let inserted = insert_job(&mut tx, &row).await?;
        tx.commit().await?;

        Ok(EnqueueResult::Created(inserted))
    }

    async fn find_by_idempotency_key(&self, key: &str, since: DateTime<Utc>) -> Result<Option<Job>> {
        let mut conn = self.pool.acquire().await?;
        Self::find_recent_by_key(&mut conn, key, since).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn get_next_job(&self, filter: &ClaimFilter) -> Result<Option<Job>> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                updated_at = NOW()
            WHERE status = 'retrying'
              AND scheduled_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending'
                  AND scheduled_at <= NOW()
                  AND attempts < max_attempts
                  AND ($1::text IS NULL OR job_type = $1)
                  AND NOT (job_type = ANY($2))
                ORDER BY priority, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing',
                attempts = jobs.attempts + 1,
                started_at = NOW(),
                updated_at = NOW()
            FROM next_job
            WHERE jobs.id = next_job.id
            RETURNING jobs.*
            "#,
        )
        .bind(filter.job_type.as_deref())
        .bind(&filter.exclude_types)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn claim_job(&self, id: Uuid) -> Result<Option<Job>> {
        // Row lock plus re-checked predicate: a concurrent claimer sees zero rows
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'processing',
                attempts = attempts + 1,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('pending', 'retrying')
              AND scheduled_at <= NOW()
              AND attempts < max_attempts
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn complete_job(&self, id: Uuid, result: Option<Value>) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                result = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return match self.get_job(id).await? {
                None => Err(JobError::NotFound(id).into()),
                Some(job) => Err(anyhow!(
                    "cannot complete job {}: status is {}",
                    id,
                    job.status
                )),
            };
        }

        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str, can_retry: bool) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(JobError::NotFound(id))?;

        if job.status != JobStatus::Processing {
            bail!("cannot fail job {}: status is {}", id, job.status);
        }

        let outcome = if can_retry && job.has_attempts_left() {
            let retry_at = self.retry_policy.retry_at(job.attempts, Utc::now());
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'retrying',
                    scheduled_at = $2,
                    last_error = $3,
                    error_history = array_append(error_history, $3),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(retry_at)
            .bind(error)
            .execute(&mut *tx)
            .await?;

            FailOutcome::Retrying { retry_at }
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    failed_at = NOW(),
                    last_error = $2,
                    error_history = array_append(error_history, $2),
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error)
            .execute(&mut *tx)
            .await?;

            FailOutcome::Failed
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn move_to_dead_letter(&self, entry: NewDeadLetterEntry) -> Result<Option<DeadLetterEntry>> {
        let mut tx = self.pool.begin().await?;

        let promoted = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'dlq',
                dlq_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(entry.original_job_id)
        .execute(&mut *tx)
        .await?;

        if promoted.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let stored = dead_letter::insert_entry(&mut tx, entry).await?;
        tx.commit().await?;

        Ok(Some(stored))
    }

    async fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT *
            FROM jobs
            WHERE ($1::job_status IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn get_stats(&self, window: Duration) -> Result<JobStats> {
        let since = cutoff(window);

        let by_status = sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM jobs WHERE created_at >= $1 GROUP BY status",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let by_type = sqlx::query_as::<_, (String, i64)>(
            "SELECT job_type, COUNT(*) FROM jobs WHERE created_at >= $1 GROUP BY job_type",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let by_priority = sqlx::query_as::<_, (JobPriority, i64)>(
            "SELECT priority, COUNT(*) FROM jobs WHERE created_at >= $1 GROUP BY priority",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let avg_processing_ms = sqlx::query_scalar::<_, Option<f64>>(
            r#"
            SELECT (AVG(EXTRACT(EPOCH FROM (completed_at - started_at))) * 1000)::float8
            FROM jobs
            WHERE status = 'completed'
              AND started_at IS NOT NULL
              AND created_at >= $1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobStats {
            since: Some(since),
            total: by_status.iter().map(|(_, n)| n).sum(),
            by_status: by_status
                .into_iter()
                .map(|(s, n)| (s.as_str().to_string(), n))
                .collect(),
            by_type: by_type.into_iter().collect(),
            by_priority: by_priority
                .into_iter()
                .map(|(p, n)| (p.as_str().to_string(), n))
                .collect(),
            avg_processing_ms,
        })
    }

    async fn retry_failed(&self, job_type: Option<&str>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = 0,
                scheduled_at = NOW(),
                failed_at = NULL,
                updated_at = NOW()
            WHERE status = 'failed'
              AND ($1::text IS NULL OR job_type = $1)
            "#,
        )
        .bind(job_type)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn purge_failed(&self, older_than: Duration) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = 'failed' AND failed_at < $1")
            .bind(cutoff(older_than))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn requeue_stalled(&self, stalled_for: Duration) -> Result<StalledSweep> {
        let since = cutoff(stalled_for);
        let error = stalled_error(stalled_for);
        let mut tx = self.pool.begin().await?;

        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                started_at = NULL,
                last_error = $2,
                error_history = array_append(error_history, $2),
                updated_at = NOW()
            WHERE status = 'processing'
              AND started_at < $1
              AND attempts < max_attempts
            "#,
        )
        .bind(since)
        .bind(&error)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let exhausted = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'failed',
                failed_at = NOW(),
                last_error = $2,
                error_history = array_append(error_history, $2),
                updated_at = NOW()
            WHERE status = 'processing'
              AND started_at < $1
              AND attempts >= max_attempts
            RETURNING *
            "#,
        )
        .bind(since)
        .bind(&error)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(StalledSweep { requeued, exhausted })
    }

    async fn failed_without_dead_letter(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT jobs.*
            FROM jobs
            LEFT JOIN dead_letter_entries dle ON dle.original_job_id = jobs.id
            WHERE jobs.status = 'failed'
              AND dle.id IS NULL
            ORDER BY jobs.failed_at NULLS FIRST
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_subtracts_window() {
        let before = Utc::now() - chrono::Duration::hours(2);
        let since = cutoff(Duration::from_secs(7200));
        assert!(since >= before);
        assert!(since < Utc::now());
    }

    #[test]
    fn cutoff_clamps_huge_windows() {
        assert_eq!(cutoff(Duration::from_secs(u64::MAX)), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(
            cutoff(Duration::from_secs(200 * 365 * 24 * 3600)),
            DateTime::<Utc>::UNIX_EPOCH
        );
    }
}
