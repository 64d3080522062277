//! Error taxonomy for job submission and execution.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised while validating, executing or routing jobs.
///
/// Store-level failures are plain `anyhow` errors and propagate to the
/// caller. `JobError` is reserved for outcomes the queue has to classify.
#[derive(Error, Debug)]
pub enum JobError {
    /// Malformed request or payload, missing tenant id. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Recoverable handler failure, retried with backoff.
    #[error("{0}")]
    Transient(String),

    /// Handler asked for the job to skip the remaining retry budget.
    #[error("{0}")]
    Permanent(String),

    /// The broker could not be reached. Producers never see this; the
    /// dispatcher spools instead.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("circuit open for job type {0}")]
    CircuitOpen(String),

    #[error("job {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    Retryable,
    /// Permanent error - goes straight to the dead letter store
    NonRetryable,
}

impl ErrorKind {
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

impl JobError {
    pub fn validation(msg: impl Into<String>) -> Self {
        JobError::Validation(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Transient(_) | JobError::BrokerUnavailable(_) | JobError::CircuitOpen(_) => {
                ErrorKind::Retryable
            }
            JobError::Validation(_) | JobError::Permanent(_) | JobError::NotFound(_) => {
                ErrorKind::NonRetryable
            }
        }
    }
}

/// Classify a handler error to determine retry behavior.
///
/// Typed `JobError`s decide for themselves. Anything else is classified by
/// message: validation, lookup and permission failures will not get better on
/// retry, everything else (network errors, timeouts) is assumed transient.
pub fn classify_error(error: &anyhow::Error) -> ErrorKind {
    if let Some(job_error) = error.downcast_ref::<JobError>() {
        return job_error.kind();
    }

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("not found")
        || error_str.contains("invalid")
        || error_str.contains("permission denied")
        || error_str.contains("unauthorized")
        || error_str.contains("forbidden")
    {
        return ErrorKind::NonRetryable;
    }

    if error_str.contains("deserialize") || error_str.contains("parse") {
        return ErrorKind::NonRetryable;
    }

    ErrorKind::Retryable
}
