//! Handler fixtures shared by the integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use relay_core::kernel::jobs::{HandlerRegistry, JobContext, JobExecutor, JobOutcome};
use relay_core::kernel::tenant::{NoopTenantIsolation, TenantContextWrapper};

/// Executor with one handler that always returns `outcome` and counts calls.
pub fn executor_with(job_type: &str, outcome: fn() -> JobOutcome) -> (JobExecutor, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut registry = HandlerRegistry::new();
    registry.register(job_type, move |_ctx: JobContext| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(outcome())
        }
    });

    let executor = JobExecutor::new(
        Arc::new(registry),
        TenantContextWrapper::new(Arc::new(NoopTenantIsolation)),
    );
    (executor, calls)
}
