//! Tenant context for job execution.
//!
//! Every tenant-scoped job runs inside a [`TenantSession`]: the tenant id is
//! visible to the handler through a task-local, and the Postgres
//! implementation pins a pooled connection with `app.current_tenant` set so
//! row-level security applies to queries made on it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::jobs::error::JobError;
use super::jobs::payload::{is_tenant_scoped, TENANT_ID_FIELD};
use super::jobs::registry::{JobContext, JobOutcome};

/// Connection pinned to one tenant for the lifetime of a session.
pub type TenantConnection = Arc<Mutex<PoolConnection<Postgres>>>;

/// Isolation state held while a handler runs.
#[derive(Clone)]
pub struct TenantSession {
    tenant_id: String,
    connection: Option<TenantConnection>,
}

impl TenantSession {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            connection: None,
        }
    }

    pub fn with_connection(tenant_id: impl Into<String>, connection: PoolConnection<Postgres>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            connection: Some(Arc::new(Mutex::new(connection))),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn connection(&self) -> Option<TenantConnection> {
        self.connection.clone()
    }
}

impl std::fmt::Debug for TenantSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSession")
            .field("tenant_id", &self.tenant_id)
            .field("pinned", &self.connection.is_some())
            .finish()
    }
}

tokio::task_local! {
    static CURRENT_TENANT: TenantSession;
}

/// Tenant of the job running on this task, if any.
pub fn current_tenant() -> Option<String> {
    CURRENT_TENANT
        .try_with(|session| session.tenant_id.clone())
        .ok()
}

/// Connection pinned for the current tenant, if the isolation backend pins one.
pub fn tenant_connection() -> Option<TenantConnection> {
    CURRENT_TENANT.try_with(|session| session.connection()).ok().flatten()
}

/// Establishes and tears down tenant isolation around a handler call.
#[async_trait]
pub trait TenantIsolation: Send + Sync {
    async fn establish(&self, tenant_id: &str) -> Result<TenantSession>;

    /// Always called once per established session. Failures are logged, not
    /// returned: the job outcome is already decided by then.
    async fn release(&self, session: TenantSession);
}

/// Tracks the tenant id only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTenantIsolation;

#[async_trait]
impl TenantIsolation for NoopTenantIsolation {
    async fn establish(&self, tenant_id: &str) -> Result<TenantSession> {
        Ok(TenantSession::new(tenant_id))
    }

    async fn release(&self, _session: TenantSession) {}
}

/// Pins a pooled connection and sets `app.current_tenant` on it.
pub struct PostgresTenantIsolation {
    pool: PgPool,
}

impl PostgresTenantIsolation {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantIsolation for PostgresTenantIsolation {
    async fn establish(&self, tenant_id: &str) -> Result<TenantSession> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT set_config('app.current_tenant', $1, false)")
            .bind(tenant_id)
            .execute(&mut *conn)
            .await?;

        Ok(TenantSession::with_connection(tenant_id, conn))
    }

    async fn release(&self, session: TenantSession) {
        let Some(connection) = session.connection else {
            return;
        };

        let mut conn = connection.lock().await;
        let reset = sqlx::query("RESET app.current_tenant")
            .execute(&mut **conn)
            .await;
        if let Err(e) = reset {
            // Closed once the last holder drops it, never returned to the pool
            warn!(
                tenant_id = %session.tenant_id,
                error = %e,
                "failed to reset tenant context; closing connection"
            );
            conn.close_on_drop();
        }
    }
}

/// Validates tenant ids and runs handlers inside a tenant session.
#[derive(Clone)]
pub struct TenantContextWrapper {
    isolation: Arc<dyn TenantIsolation>,
}

impl TenantContextWrapper {
    pub fn new(isolation: Arc<dyn TenantIsolation>) -> Self {
        Self { isolation }
    }

    /// Run `handler` for the job described by `ctx`.
    ///
    /// A tenant-scoped job without a tenant id is dead-lettered without
    /// running the handler. If isolation cannot be established the handler
    /// still runs, unscoped, and a degraded-mode warning is logged. A panic in
    /// the handler is caught after the session is released and reported as
    /// a transient error.
    pub async fn run<Fut>(&self, ctx: &JobContext, handler: Fut) -> Result<JobOutcome>
    where
        Fut: Future<Output = Result<JobOutcome>> + Send,
    {
        let tenant_id = ctx.tenant_id().map(str::to_string);

        let Some(tenant_id) = tenant_id else {
            if is_tenant_scoped(&ctx.job_type) {
                let err = JobError::validation(format!(
                    "{} job {} is missing {}",
                    ctx.job_type, ctx.job_id, TENANT_ID_FIELD
                ));
                warn!(job_id = %ctx.job_id, job_type = %ctx.job_type, error = %err, "rejecting job without tenant");
                return Ok(JobOutcome::dead_letter(err.to_string()));
            }
            return settle(AssertUnwindSafe(handler).catch_unwind().await);
        };

        let session = match self.isolation.establish(&tenant_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    job_id = %ctx.job_id,
                    job_type = %ctx.job_type,
                    tenant_id = %tenant_id,
                    error = %e,
                    "tenant isolation unavailable; running handler in degraded mode without tenant context"
                );
                return settle(AssertUnwindSafe(handler).catch_unwind().await);
            }
        };

        debug!(job_id = %ctx.job_id, tenant_id = %tenant_id, "tenant context established");

        let result = CURRENT_TENANT
            .scope(session.clone(), AssertUnwindSafe(handler).catch_unwind())
            .await;

        self.isolation.release(session).await;
        debug!(job_id = %ctx.job_id, tenant_id = %tenant_id, "tenant context released");

        settle(result)
    }
}

fn settle(result: std::result::Result<Result<JobOutcome>, Box<dyn Any + Send>>) -> Result<JobOutcome> {
    result.unwrap_or_else(|panic| {
        Err(JobError::Transient(format!("handler panicked: {}", panic_message(panic.as_ref()))).into())
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::JobPriority;
    use crate::kernel::jobs::payload::{JobPayload, NotificationPayload, NOTIFICATION};
    use crate::kernel::jobs::testing::{FailingTenantIsolation, RecordingTenantIsolation};
    use serde_json::json;
    use uuid::Uuid;

    async fn exploding_handler() -> Result<JobOutcome> {
        panic!("boom")
    }

    fn notification(tenant_id: &str) -> JobContext {
        JobContext {
            job_id: Uuid::now_v7(),
            job_type: NOTIFICATION.to_string(),
            payload: JobPayload::Notification(NotificationPayload {
                tenant_id: tenant_id.to_string(),
                user_id: "u-1".into(),
                kind: "mention".into(),
                data: json!({}),
            }),
            attempt: 1,
            priority: JobPriority::Normal,
        }
    }

    #[tokio::test]
    async fn handler_sees_current_tenant() {
        let isolation = Arc::new(RecordingTenantIsolation::default());
        let wrapper = TenantContextWrapper::new(isolation.clone());

        let outcome = wrapper
            .run(&notification("t-42"), async {
                Ok(JobOutcome::with_result(json!(current_tenant())))
            })
            .await
            .unwrap();

        assert_eq!(outcome, JobOutcome::with_result(json!("t-42")));
        assert_eq!(isolation.established(), vec!["t-42".to_string()]);
        assert_eq!(isolation.released(), vec!["t-42".to_string()]);
        assert_eq!(current_tenant(), None);
    }

    #[tokio::test]
    async fn missing_tenant_is_dead_lettered_without_running_handler() {
        let wrapper = TenantContextWrapper::new(Arc::new(NoopTenantIsolation));
        let ctx = notification("   ");

        let outcome = wrapper
            .run(&ctx, exploding_handler())
            .await
            .unwrap();

        match outcome {
            JobOutcome::DeadLetter { error } => assert!(error.contains("tenant_id")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn isolation_failure_runs_handler_degraded() {
        let wrapper = TenantContextWrapper::new(Arc::new(FailingTenantIsolation));

        let outcome = wrapper
            .run(&notification("t-1"), async {
                Ok(JobOutcome::with_result(json!(current_tenant())))
            })
            .await
            .unwrap();

        assert_eq!(outcome, JobOutcome::with_result(json!(null)));
    }

    #[tokio::test]
    async fn session_is_released_when_handler_panics() {
        let isolation = Arc::new(RecordingTenantIsolation::default());
        let wrapper = TenantContextWrapper::new(isolation.clone());

        let err = wrapper
            .run(&notification("t-9"), exploding_handler())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("handler panicked: boom"));
        assert_eq!(isolation.released(), vec!["t-9".to_string()]);
    }

    #[tokio::test]
    async fn unscoped_job_without_tenant_runs_plainly() {
        let wrapper = TenantContextWrapper::new(Arc::new(FailingTenantIsolation));
        let ctx = JobContext {
            job_id: Uuid::now_v7(),
            job_type: "analytics.record".into(),
            payload: JobPayload::Opaque {
                job_type: "analytics.record".into(),
                data: json!({}),
            },
            attempt: 1,
            priority: JobPriority::Low,
        };

        let outcome = wrapper
            .run(&ctx, async { Ok(JobOutcome::completed()) })
            .await
            .unwrap();
        assert!(outcome.is_success());
    }
}
