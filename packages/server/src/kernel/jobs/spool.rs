//! Durable fallback spool.
//!
//! Storage-only safety net used while the broker is unreachable. The spool
//! never runs handlers itself; the drainer moves its rows back to the broker
//! or executes them inline.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::error;
use uuid::Uuid;

use super::job::{Job, JobPriority, DEFAULT_MAX_ATTEMPTS};
use super::ledger::cutoff;

/// Pending rows above which the system is considered to be running on the spool.
pub const DEFAULT_FALLBACK_THRESHOLD: i64 = 50;

/// Request to spool a job. Re-spooling the same `job_id` replaces the row.
#[derive(Debug, Clone)]
pub struct SpoolRequest {
    pub job_id: Uuid,
    pub job_type: String,
    pub payload: Value,
    pub priority: JobPriority,
    pub tenant_id: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl SpoolRequest {
    pub fn new(job_id: Uuid, job_type: impl Into<String>, payload: Value) -> Self {
        let tenant_id = payload
            .get(super::payload::TENANT_ID_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            job_id,
            job_type: job_type.into(),
            payload,
            priority: JobPriority::Normal,
            tenant_id,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Spool copy of a ledger job.
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            priority: job.priority,
            tenant_id: job.tenant_id().map(str::to_string),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            scheduled_at: Some(job.scheduled_at),
        }
    }
}

/// Row as stored; `job_data` is raw text until parsed.
#[derive(FromRow, Debug, Clone)]
struct SpoolRow {
    id: Uuid,
    job_id: Uuid,
    job_type: String,
    job_data: String,
    priority: JobPriority,
    tenant_id: Option<String>,
    attempts: i32,
    max_attempts: i32,
    scheduled_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

/// A spooled job as handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SpooledJob {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_type: String,
    /// `None` when the stored payload could not be parsed
    pub job_data: Option<Value>,
    pub priority: JobPriority,
    pub tenant_id: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SpooledJob {
    /// Parse a stored payload, surfacing malformed data as `None`.
    pub fn parse_job_data(job_id: Uuid, job_type: &str, tenant_id: Option<&str>, raw: &str) -> Option<Value> {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(
                    job_id = %job_id,
                    job_type = %job_type,
                    tenant_id = tenant_id.unwrap_or("-"),
                    raw_len = raw.len(),
                    error = %e,
                    "malformed spooled payload; surfacing job without data"
                );
                None
            }
        }
    }
}

impl From<SpoolRow> for SpooledJob {
    fn from(row: SpoolRow) -> Self {
        let job_data =
            SpooledJob::parse_job_data(row.job_id, &row.job_type, row.tenant_id.as_deref(), &row.job_data);
        Self {
            id: row.id,
            job_id: row.job_id,
            job_type: row.job_type,
            job_data,
            priority: row.priority,
            tenant_id: row.tenant_id,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            scheduled_at: row.scheduled_at,
            processed_at: row.processed_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpoolStats {
    pub total: i64,
    /// Unclaimed rows
    pub pending: i64,
    /// Claimed by a drainer but not yet removed
    pub claimed: i64,
    pub pending_by_priority: BTreeMap<String, i64>,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait JobSpool: Send + Sync {
    /// Idempotent upsert keyed by `job_id`.
    async fn spool_job(&self, request: SpoolRequest) -> Result<SpooledJob>;

    /// Claim up to `limit` unclaimed, due rows in priority-then-FIFO order.
    async fn get_next_jobs(&self, limit: i64) -> Result<Vec<SpooledJob>>;

    /// Delete after a confirmed handoff. False if nothing was removed.
    async fn remove_job(&self, job_id: Uuid, tenant_id: Option<&str>) -> Result<bool>;

    /// Unclaim a row so a later cycle picks it up again.
    async fn release_job(&self, job_id: Uuid) -> Result<bool>;

    /// Unclaim rows claimed longer than `claimed_for` ago.
    async fn requeue_stalled(&self, claimed_for: Duration) -> Result<u64>;

    /// Delete claimed rows whose claim is older than `older_than_hours`.
    async fn cleanup_processed_jobs(&self, older_than_hours: i64) -> Result<u64>;

    async fn get_spool_stats(&self) -> Result<SpoolStats>;

    async fn pending_count(&self) -> Result<i64>;

    /// Alerting signal only; not used for control flow.
    async fn should_activate_fallback(&self, threshold: i64) -> Result<bool> {
        Ok(self.pending_count().await? > threshold)
    }
}

pub struct PostgresJobSpool {
    pool: PgPool,
}

impl PostgresJobSpool {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobSpool for PostgresJobSpool {
    async fn spool_job(&self, request: SpoolRequest) -> Result<SpooledJob> {
        let job_data = serde_json::to_string(&request.payload)?;
        let scheduled_at = request.scheduled_at.unwrap_or_else(Utc::now);

        let row = sqlx::query_as::<_, SpoolRow>(
            r#"
            INSERT INTO spooled_jobs (
                id, job_id, job_type, job_data, priority, tenant_id,
                attempts, max_attempts, scheduled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (job_id) DO UPDATE
            SET job_type = EXCLUDED.job_type,
                job_data = EXCLUDED.job_data,
                priority = EXCLUDED.priority,
                tenant_id = EXCLUDED.tenant_id,
                attempts = EXCLUDED.attempts,
                max_attempts = EXCLUDED.max_attempts,
                scheduled_at = EXCLUDED.scheduled_at,
                processed_at = NULL,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(request.job_id)
        .bind(&request.job_type)
        .bind(job_data)
        .bind(request.priority)
        .bind(&request.tenant_id)
        .bind(request.attempts)
        .bind(request.max_attempts)
        .bind(scheduled_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn get_next_jobs(&self, limit: i64) -> Result<Vec<SpooledJob>> {
        let mut rows = sqlx::query_as::<_, SpoolRow>(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM spooled_jobs
                WHERE processed_at IS NULL
                  AND scheduled_at <= NOW()
                ORDER BY priority, created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE spooled_jobs
            SET processed_at = NOW(),
                updated_at = NOW()
            FROM next_jobs
            WHERE spooled_jobs.id = next_jobs.id
            RETURNING spooled_jobs.*
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        // UPDATE ... RETURNING does not preserve the CTE order
        rows.sort_by(|a, b| (a.priority, a.created_at).cmp(&(b.priority, b.created_at)));

        Ok(rows.into_iter().map(SpooledJob::from).collect())
    }

    async fn remove_job(&self, job_id: Uuid, tenant_id: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM spooled_jobs
            WHERE job_id = $1
              AND ($2::text IS NULL OR tenant_id = $2)
            "#,
        )
        .bind(job_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_job(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE spooled_jobs
            SET processed_at = NULL,
                updated_at = NOW()
            WHERE job_id = $1 AND processed_at IS NOT NULL
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn requeue_stalled(&self, claimed_for: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE spooled_jobs
            SET processed_at = NULL,
                updated_at = NOW()
            WHERE processed_at IS NOT NULL
              AND processed_at < $1
            "#,
        )
        .bind(cutoff(claimed_for))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn cleanup_processed_jobs(&self, older_than_hours: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM spooled_jobs
            WHERE processed_at IS NOT NULL
              AND processed_at < NOW() - make_interval(hours => $1::int)
            "#,
        )
        .bind(older_than_hours.clamp(0, i32::MAX as i64) as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_spool_stats(&self) -> Result<SpoolStats> {
        let (total, pending, oldest_pending_at) =
            sqlx::query_as::<_, (i64, i64, Option<DateTime<Utc>>)>(
                r#"
                SELECT
                    COUNT(*),
                    COUNT(*) FILTER (WHERE processed_at IS NULL),
                    MIN(created_at) FILTER (WHERE processed_at IS NULL)
                FROM spooled_jobs
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        let by_priority = sqlx::query_as::<_, (JobPriority, i64)>(
            r#"
            SELECT priority, COUNT(*)
            FROM spooled_jobs
            WHERE processed_at IS NULL
            GROUP BY priority
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(SpoolStats {
            total,
            pending,
            claimed: total - pending,
            pending_by_priority: by_priority
                .into_iter()
                .map(|(p, n)| (p.as_str().to_string(), n))
                .collect(),
            oldest_pending_at,
        })
    }

    async fn pending_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM spooled_jobs WHERE processed_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_job_data_surfaces_as_none() {
        let parsed = SpooledJob::parse_job_data(Uuid::now_v7(), "notification", Some("t"), "{not json");
        assert!(parsed.is_none());

        let parsed = SpooledJob::parse_job_data(Uuid::now_v7(), "notification", None, r#"{"a":1}"#);
        assert_eq!(parsed, Some(json!({ "a": 1 })));
    }

    #[test]
    fn request_picks_up_tenant_from_payload() {
        let request = SpoolRequest::new(
            Uuid::now_v7(),
            "message_delivery",
            json!({ "tenant_id": "t-7", "text": "hi" }),
        )
        .with_priority(JobPriority::High);

        assert_eq!(request.tenant_id.as_deref(), Some("t-7"));
        assert_eq!(request.priority, JobPriority::High);
        assert_eq!(request.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn request_for_ledger_job_keeps_its_budget() {
        let mut job = Job::from_new(
            super::super::job::NewJob::builder()
                .job_type("notification")
                .payload(json!({ "tenant_id": "t-2", "user_id": "u", "kind": "k" }))
                .max_attempts(5)
                .build(),
        );
        job.attempts = 2;

        let request = SpoolRequest::for_job(&job);

        assert_eq!(request.job_id, job.id);
        assert_eq!(request.tenant_id.as_deref(), Some("t-2"));
        assert_eq!((request.attempts, request.max_attempts), (2, 5));
        assert_eq!(request.scheduled_at, Some(job.scheduled_at));
    }
}
