//! Handler registry.
//!
//! Maps job type strings (e.g. "message_delivery") to async handlers. Handler
//! business logic lives outside the queue; the registry only invokes it and
//! interprets the structured outcome.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::job::{Job, JobPriority};
use super::payload::JobPayload;

/// Everything a handler gets to see about the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub job_type: String,
    pub payload: JobPayload,
    /// 1-based attempt number
    pub attempt: i32,
    pub priority: JobPriority,
}

impl JobContext {
    pub fn from_job(job: &Job, payload: JobPayload) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload,
            attempt: job.attempts,
            priority: job.priority,
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.payload.tenant_id()
    }
}

/// What a handler decided about its job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { result: Option<Value> },
    /// Recoverable failure; retried while attempts remain
    Retry { error: String },
    /// Permanent failure; skips the remaining retry budget
    DeadLetter { error: String },
}

impl JobOutcome {
    pub fn completed() -> Self {
        JobOutcome::Completed { result: None }
    }

    pub fn with_result(result: Value) -> Self {
        JobOutcome::Completed {
            result: Some(result),
        }
    }

    pub fn retry(error: impl Into<String>) -> Self {
        JobOutcome::Retry {
            error: error.into(),
        }
    }

    pub fn dead_letter(error: impl Into<String>) -> Self {
        JobOutcome::DeadLetter {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Completed { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobOutcome::Completed { .. } => None,
            JobOutcome::Retry { error } | JobOutcome::DeadLetter { error } => Some(error),
        }
    }
}

/// Loosely-typed result shape some handlers prefer to return.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerResult {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// `Some(false)` forbids a retry
    #[serde(default)]
    pub retry: Option<bool>,
    /// `true` routes straight to the dead letter store
    #[serde(default)]
    pub dlq: bool,
}

impl From<HandlerResult> for JobOutcome {
    fn from(r: HandlerResult) -> Self {
        if r.success {
            return JobOutcome::Completed { result: r.result };
        }
        let error = r
            .error
            .unwrap_or_else(|| "handler reported failure".to_string());
        if r.dlq || r.retry == Some(false) {
            JobOutcome::DeadLetter { error }
        } else {
            JobOutcome::Retry { error }
        }
    }
}

type BoxedHandler =
    Box<dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<JobOutcome>> + Send>> + Send + Sync>;

/// Registry that maps job type strings to handlers.
///
/// Handlers are registered once at startup and shared through
/// [`SharedHandlerRegistry`].
///
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register(MESSAGE_DELIVERY, |ctx| async move {
///     deliver(&ctx.payload).await?;
///     Ok(JobOutcome::completed())
/// });
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register (or replace) the handler for a job type.
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutcome>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.insert(job_type.into(), boxed);
    }

    /// Run the handler for `ctx.job_type`. `None` if nothing is registered.
    pub fn invoke(&self, ctx: JobContext) -> Option<Pin<Box<dyn Future<Output = Result<JobOutcome>> + Send>>> {
        self.handlers.get(&ctx.job_type).map(|handler| handler(ctx))
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

pub type SharedHandlerRegistry = Arc<HandlerRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(job_type: &str) -> JobContext {
        JobContext {
            job_id: Uuid::now_v7(),
            job_type: job_type.to_string(),
            payload: JobPayload::Opaque {
                job_type: job_type.to_string(),
                data: json!({}),
            },
            attempt: 1,
            priority: JobPriority::Normal,
        }
    }

    #[tokio::test]
    async fn registered_handler_is_invoked() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", |ctx: JobContext| async move {
            Ok(JobOutcome::with_result(json!({ "attempt": ctx.attempt })))
        });

        assert!(registry.is_registered("echo"));
        assert_eq!(registry.registered_types(), vec!["echo".to_string()]);

        let outcome = registry.invoke(ctx("echo")).unwrap().await.unwrap();
        assert_eq!(outcome, JobOutcome::with_result(json!({ "attempt": 1 })));
    }

    #[test]
    fn unknown_type_has_no_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.invoke(ctx("missing")).is_none());
    }

    #[test]
    fn handler_result_maps_to_outcome() {
        let ok = HandlerResult {
            success: true,
            result: Some(json!(1)),
            ..Default::default()
        };
        assert_eq!(JobOutcome::from(ok), JobOutcome::with_result(json!(1)));

        let transient = HandlerResult {
            success: false,
            error: Some("timeout".into()),
            ..Default::default()
        };
        assert_eq!(JobOutcome::from(transient), JobOutcome::retry("timeout"));

        let no_retry = HandlerResult {
            success: false,
            error: Some("bad recipient".into()),
            retry: Some(false),
            ..Default::default()
        };
        assert_eq!(JobOutcome::from(no_retry), JobOutcome::dead_letter("bad recipient"));

        let dlq: HandlerResult =
            serde_json::from_value(json!({ "success": false, "dlq": true })).unwrap();
        assert_eq!(
            JobOutcome::from(dlq),
            JobOutcome::dead_letter("handler reported failure")
        );
    }
}
