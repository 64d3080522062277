//! Supervises the background services of one process.
//!
//! Every service gets a child of the host's cancellation token. Stopping
//! cancels the token and waits for each task, so a cycle in flight (a job
//! execution, a drain batch) finishes before the process exits.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::kernel::jobs::drainer::DrainerCounters;
use crate::kernel::QueueKernel;

/// Which services [`WorkerHost::start`] spawns.
#[derive(Debug, Clone, Copy)]
pub struct HostServices {
    pub runner: bool,
    pub drainer: bool,
    pub broker_worker: bool,
    pub reaper: bool,
}

impl Default for HostServices {
    fn default() -> Self {
        Self {
            runner: true,
            drainer: true,
            broker_worker: true,
            reaper: true,
        }
    }
}

pub struct WorkerHost {
    shutdown: CancellationToken,
    tasks: JoinSet<(&'static str, Result<()>)>,
    drainer_counters: Option<Arc<DrainerCounters>>,
}

impl Default for WorkerHost {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerHost {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tasks: JoinSet::new(),
            drainer_counters: None,
        }
    }

    /// Spawn the selected services from `kernel`.
    pub fn start(kernel: &QueueKernel, services: HostServices) -> Self {
        let mut host = Self::new();

        if services.runner {
            let runner = kernel.runner();
            host.spawn("job_runner", |token| runner.run(token));
        }
        if services.drainer {
            let drainer = kernel.drainer();
            host.drainer_counters = Some(drainer.counters());
            host.spawn("spool_drainer", |token| drainer.run(token));
        }
        if services.broker_worker {
            let worker = kernel.broker_worker();
            host.spawn("broker_worker", |token| worker.run(token));
        }
        if services.reaper {
            let reaper = kernel.reaper();
            host.spawn("stalled_job_reaper", |token| reaper.run(token));
        }

        info!(services = host.tasks.len(), "worker host started");
        host
    }

    /// Spawn a service that stops when its token is cancelled.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, service: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let fut = service(self.shutdown.child_token());
        self.tasks.spawn(async move { (name, fut.await) });
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Counters of the spawned drainer, for [`crate::kernel::jobs::JobAdmin::with_drainer`].
    pub fn drainer_counters(&self) -> Option<Arc<DrainerCounters>> {
        self.drainer_counters.clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every service and wait for them to stop.
    pub async fn shutdown(self) -> Result<()> {
        info!("worker host stopping");
        self.shutdown.cancel();
        self.join().await
    }

    /// Wait for every service to exit. The first failure is returned after
    /// the rest have stopped.
    pub async fn join(mut self) -> Result<()> {
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    info!(service = name, "service stopped");
                    None
                }
                Ok((name, Err(e))) => Some(anyhow!("{} failed: {:#}", name, e)),
                Err(e) => Some(anyhow!("service task aborted: {}", e)),
            };

            if let Some(e) = failure {
                error!(error = %e, "service exited with error");
                // One dead service takes the rest down
                self.shutdown.cancel();
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
