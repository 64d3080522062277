//! Runs a job's handler inside its tenant context and turns whatever happens
//! into a [`JobOutcome`]. Shared by the ledger runner, the broker worker and
//! the drainer's inline path.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::classify_error;
use super::job::{Job, JobPriority};
use super::payload::JobPayload;
use super::registry::{JobContext, JobOutcome, SharedHandlerRegistry};
use crate::kernel::tenant::TenantContextWrapper;

#[derive(Clone)]
pub struct JobExecutor {
    registry: SharedHandlerRegistry,
    tenant: TenantContextWrapper,
}

impl JobExecutor {
    pub fn new(registry: SharedHandlerRegistry, tenant: TenantContextWrapper) -> Self {
        Self { registry, tenant }
    }

    pub fn registry(&self) -> &SharedHandlerRegistry {
        &self.registry
    }

    /// Execute a claimed ledger job.
    pub async fn execute_job(&self, job: &Job) -> JobOutcome {
        self.execute_parts(
            job.id,
            &job.job_type,
            job.payload.clone(),
            job.attempts,
            job.priority,
        )
        .await
    }

    /// Execute from raw parts.
    ///
    /// A payload that fails typed validation is dead-lettered without
    /// reaching the handler.
    pub async fn execute_parts(
        &self,
        job_id: Uuid,
        job_type: &str,
        payload: Value,
        attempt: i32,
        priority: JobPriority,
    ) -> JobOutcome {
        let payload = match JobPayload::from_parts(job_type, payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %job_id, job_type = %job_type, error = %e, "invalid job payload");
                return JobOutcome::dead_letter(e.to_string());
            }
        };

        self.execute(JobContext {
            job_id,
            job_type: job_type.to_string(),
            payload,
            attempt,
            priority,
        })
        .await
    }

    /// Never fails: handler errors and panics become `Retry`/`DeadLetter`.
    pub async fn execute(&self, ctx: JobContext) -> JobOutcome {
        let Some(handler) = self.registry.invoke(ctx.clone()) else {
            warn!(job_id = %ctx.job_id, job_type = %ctx.job_type, "no handler registered");
            return JobOutcome::dead_letter(format!(
                "no handler registered for job type {}",
                ctx.job_type
            ));
        };

        debug!(
            job_id = %ctx.job_id,
            job_type = %ctx.job_type,
            attempt = ctx.attempt,
            "executing job"
        );

        match self.tenant.run(&ctx, handler).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("{:#}", e);
                if classify_error(&e).should_retry() {
                    JobOutcome::Retry { error: message }
                } else {
                    JobOutcome::DeadLetter { error: message }
                }
            }
        }
    }
}
