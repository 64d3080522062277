//! Job model for the priority job ledger.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::error::JobError;
use super::payload::JobPayload;
use crate::common::utils::derive_idempotency_key;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    Dlq,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::Dlq => "dlq",
        }
    }

    /// Statuses that still count as live work in the ledger.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Processing | JobStatus::Retrying
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Dlq
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            "dlq" => Ok(JobStatus::Dlq),
            other => Err(JobError::validation(format!("unknown job status {:?}", other))),
        }
    }
}

/// Dequeue urgency. Declaration order is the dequeue order, so the derived
/// `Ord` and the Postgres enum both sort `Critical` first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Convert to integer for ordering (lower = higher priority)
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Critical => "critical",
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }

    /// All priorities, most urgent first.
    pub fn all() -> [JobPriority; 4] {
        [
            JobPriority::Critical,
            JobPriority::High,
            JobPriority::Normal,
            JobPriority::Low,
        ]
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(JobPriority::Critical),
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            other => Err(JobError::validation(format!("unknown job priority {:?}", other))),
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub status: JobStatus,

    // Attempts only grow on PENDING -> PROCESSING
    pub attempts: i32,
    pub max_attempts: i32,
    pub scheduled_at: DateTime<Utc>,

    pub idempotency_key: String,

    // Append-only
    pub error_history: Vec<String>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub dlq_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Materialize a submission as a fresh PENDING row.
    pub fn from_new(new: NewJob) -> Self {
        let now = Utc::now();
        let idempotency_key = new.resolved_idempotency_key();
        Self {
            id: Uuid::now_v7(),
            job_type: new.job_type,
            payload: new.payload,
            priority: new.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            scheduled_at: new.scheduled_at.unwrap_or(now),
            idempotency_key,
            error_history: Vec::new(),
            last_error: None,
            result: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            dlq_at: None,
            updated_at: now,
        }
    }

    /// Check if the job is eligible for dequeue at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.scheduled_at <= now
            && self.attempts < self.max_attempts
    }

    /// Whether another attempt fits in the budget after the current one failed.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Decode the stored payload. Failure means the row is permanently invalid.
    pub fn typed_payload(&self) -> Result<JobPayload, JobError> {
        JobPayload::from_parts(&self.job_type, self.payload.clone())
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.payload
            .get(super::payload::TENANT_ID_FIELD)
            .and_then(serde_json::Value::as_str)
    }
}

/// A validated request to add a job to the ledger.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,
}

impl NewJob {
    /// Caller-supplied key, or one derived from type and payload.
    pub fn resolved_idempotency_key(&self) -> String {
        self.idempotency_key
            .clone()
            .unwrap_or_else(|| derive_idempotency_key(&self.job_type, &self.payload))
    }

    /// Structural checks the ledger enforces regardless of payload typing.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.job_type.trim().is_empty() {
            return Err(JobError::validation("job type is empty"));
        }
        if !self.payload.is_object() {
            return Err(JobError::validation(format!(
                "payload for {} must be a JSON object",
                self.job_type
            )));
        }
        if self.max_attempts < 1 {
            return Err(JobError::validation(format!(
                "max_attempts must be at least 1, got {}",
                self.max_attempts
            )));
        }
        if let Some(key) = &self.idempotency_key {
            if key.trim().is_empty() {
                return Err(JobError::validation("idempotency key is empty"));
            }
        }
        Ok(())
    }
}

/// Optional knobs for a producer submission.
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option, into)))]
pub struct SubmitOptions {
    pub priority: Option<JobPriority>,
    pub max_attempts: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

/// Result type for enqueue operations that handles idempotency.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// Job was inserted
    Created(Job),
    /// A job with the same idempotency key exists inside the dedup window
    Duplicate(Job),
}

impl EnqueueResult {
    pub fn job(&self) -> &Job {
        match self {
            EnqueueResult::Created(job) | EnqueueResult::Duplicate(job) => job,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job().id
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }

    pub fn into_job(self) -> Job {
        match self {
            EnqueueResult::Created(job) | EnqueueResult::Duplicate(job) => job,
        }
    }
}

/// What `fail_job` did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Scheduled for another attempt
    Retrying { retry_at: DateTime<Utc> },
    /// Terminal from the ledger's point of view; awaiting dead-letter promotion
    Failed,
}

/// Restricts which rows a dequeue may claim.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub job_type: Option<String>,
    pub exclude_types: Vec<String>,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn only(job_type: impl Into<String>) -> Self {
        Self {
            job_type: Some(job_type.into()),
            exclude_types: Vec::new(),
        }
    }

    pub fn excluding(mut self, job_types: Vec<String>) -> Self {
        self.exclude_types = job_types;
        self
    }

    pub fn matches(&self, job_type: &str) -> bool {
        self.job_type.as_deref().map_or(true, |t| t == job_type)
            && !self.exclude_types.iter().any(|t| t == job_type)
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Exponential backoff for ledger retries: `base * 2^attempts`, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600), // Max 1 hour
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.clamp(0, 31) as u32;
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn retry_at(&self, attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for(attempts);
        now + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64)
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Aggregate ledger counts over a trailing window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub since: Option<DateTime<Utc>>,
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_type: BTreeMap<String, i64>,
    pub by_priority: BTreeMap<String, i64>,
    /// Mean of `completed_at - started_at` for completed jobs, in ms
    pub avg_processing_ms: Option<f64>,
}
