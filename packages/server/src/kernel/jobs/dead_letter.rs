//! Dead letter store: terminal holding area for jobs that cannot succeed.
//!
//! Entries are created once per failed job (keyed by `original_job_id`),
//! mutated only by the review action and never deleted automatically.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::job::{Job, JobPriority};

lazy_static! {
    /// Errors that need a human even on non-critical jobs.
    static ref MANUAL_REVIEW_PATTERN: Regex = Regex::new(
        r"(?i)\b(security|unauthori[sz]ed|forbidden|fraud|signature|payment|billing|charge|refund|invoice|compliance|gdpr|consent|legal|pii)\b"
    )
    .unwrap();
}

/// Whether a dead-lettered job should be flagged for manual review.
pub fn requires_manual_review(priority: JobPriority, error: &str) -> bool {
    priority == JobPriority::Critical || MANUAL_REVIEW_PATTERN.is_match(error)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "dlq_review_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    /// Re-submit a fresh job with the same type and payload
    Retry,
    /// Close the entry without resubmission
    Discard,
}

impl std::str::FromStr for ReviewAction {
    type Err = super::error::JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "retry" => Ok(ReviewAction::Retry),
            "discard" => Ok(ReviewAction::Discard),
            other => Err(super::error::JobError::validation(format!(
                "unknown review action {:?}",
                other
            ))),
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub original_job_id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub last_error: String,
    pub error_history: Vec<String>,
    pub attempts: i32,
    pub requires_manual_review: bool,
    pub reviewed: bool,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
    pub review_action: Option<ReviewAction>,
    pub retried_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Fields captured when a job is dead-lettered.
#[derive(Debug, Clone)]
pub struct NewDeadLetterEntry {
    pub original_job_id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub last_error: String,
    pub error_history: Vec<String>,
    pub attempts: i32,
    pub requires_manual_review: bool,
}

impl NewDeadLetterEntry {
    /// Capture a failed ledger job. `error` is appended to the history if the
    /// ledger has not recorded it yet.
    pub fn from_job(job: &Job, error: &str) -> Self {
        let mut error_history = job.error_history.clone();
        if error_history.last().map(String::as_str) != Some(error) {
            error_history.push(error.to_string());
        }
        Self {
            original_job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            priority: job.priority,
            last_error: error.to_string(),
            error_history,
            attempts: job.attempts,
            requires_manual_review: requires_manual_review(job.priority, error),
        }
    }

    pub fn into_entry(self) -> DeadLetterEntry {
        DeadLetterEntry {
            id: Uuid::now_v7(),
            original_job_id: self.original_job_id,
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            last_error: self.last_error,
            error_history: self.error_history,
            attempts: self.attempts,
            requires_manual_review: self.requires_manual_review,
            reviewed: false,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
            review_action: None,
            retried_job_id: None,
            created_at: Utc::now(),
        }
    }
}

/// A review decision recorded against an entry.
#[derive(Debug, Clone)]
pub struct ReviewDecision {
    pub action: ReviewAction,
    pub reviewed_by: String,
    pub notes: Option<String>,
    pub retried_job_id: Option<Uuid>,
}

/// Outcome of `mark_reviewed`. Reviewing twice is a no-op, not an error.
#[derive(Debug, Clone)]
pub enum ReviewUpdate {
    Applied(DeadLetterEntry),
    AlreadyReviewed(DeadLetterEntry),
}

impl ReviewUpdate {
    pub fn entry(&self) -> &DeadLetterEntry {
        match self {
            ReviewUpdate::Applied(e) | ReviewUpdate::AlreadyReviewed(e) => e,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, ReviewUpdate::Applied(_))
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert an entry unless one exists for the same original job; either way
    /// the stored entry is returned.
    async fn record(&self, entry: NewDeadLetterEntry) -> Result<DeadLetterEntry>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>>;

    async fn find_by_original_job(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>>;

    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterEntry>>;

    /// Unreviewed entries, manual-review ones first, oldest first.
    async fn list_pending_review(&self, limit: i64) -> Result<Vec<DeadLetterEntry>>;

    async fn count_pending_review(&self) -> Result<i64>;

    /// Stamp the review, only if the entry has not been reviewed yet.
    async fn mark_reviewed(&self, id: Uuid, decision: ReviewDecision) -> Result<Option<ReviewUpdate>>;
}

/// PostgreSQL-backed dead letter store.
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn record(&self, entry: NewDeadLetterEntry) -> Result<DeadLetterEntry> {
        let mut tx = self.pool.begin().await?;
        let stored = insert_entry(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(
            "SELECT * FROM dead_letter_entries WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    async fn find_by_original_job(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(
            "SELECT * FROM dead_letter_entries WHERE original_job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        let entries = sqlx::query_as::<_, DeadLetterEntry>(
            "SELECT * FROM dead_letter_entries ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn list_pending_review(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        let entries = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            SELECT *
            FROM dead_letter_entries
            WHERE reviewed = FALSE
            ORDER BY requires_manual_review DESC, created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn count_pending_review(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM dead_letter_entries WHERE reviewed = FALSE",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn mark_reviewed(&self, id: Uuid, decision: ReviewDecision) -> Result<Option<ReviewUpdate>> {
        let updated = sqlx::query_as::<_, DeadLetterEntry>(
            r#"
            UPDATE dead_letter_entries
            SET reviewed = TRUE,
                reviewed_by = $2,
                reviewed_at = NOW(),
                review_notes = $3,
                review_action = $4,
                retried_job_id = $5
            WHERE id = $1 AND reviewed = FALSE
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&decision.reviewed_by)
        .bind(&decision.notes)
        .bind(decision.action)
        .bind(decision.retried_job_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(entry) = updated {
            return Ok(Some(ReviewUpdate::Applied(entry)));
        }

        Ok(self.get(id).await?.map(ReviewUpdate::AlreadyReviewed))
    }
}

/// Insert inside an open transaction so the ledger can pair it with the
/// job's DLQ transition.
pub(crate) async fn insert_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    entry: NewDeadLetterEntry,
) -> Result<DeadLetterEntry> {
    let original_job_id = entry.original_job_id;
    let row = entry.into_entry();

    let inserted = sqlx::query_as::<_, DeadLetterEntry>(
        r#"
        INSERT INTO dead_letter_entries (
            id, original_job_id, job_type, payload, priority, last_error,
            error_history, attempts, requires_manual_review, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (original_job_id) DO NOTHING
        RETURNING *
        "#,
    )
    .bind(row.id)
    .bind(row.original_job_id)
    .bind(&row.job_type)
    .bind(&row.payload)
    .bind(row.priority)
    .bind(&row.last_error)
    .bind(&row.error_history)
    .bind(row.attempts)
    .bind(row.requires_manual_review)
    .bind(row.created_at)
    .fetch_optional(&mut **tx)
    .await?;

    match inserted {
        Some(entry) => Ok(entry),
        None => {
            let existing = sqlx::query_as::<_, DeadLetterEntry>(
                "SELECT * FROM dead_letter_entries WHERE original_job_id = $1",
            )
            .bind(original_job_id)
            .fetch_one(&mut **tx)
            .await?;
            Ok(existing)
        }
    }
}
