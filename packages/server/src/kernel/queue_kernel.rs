// QueueKernel - delivery infrastructure with all dependencies
//
// Holds the stores, broker and executor behind their traits so services and
// tests can be built from the same parts.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use super::broker::{Broker, JobDispatcher, RedisBroker};
use super::jobs::{
    BrokerWorker, DeadLetterStore, JobAdmin, JobExecutor, JobLedger, JobRunner, JobSpool,
    PostgresDeadLetterStore, PostgresJobLedger, PostgresJobSpool, ReliableJobQueue,
    SharedHandlerRegistry, SpoolDrainer, StalledJobReaper,
};
use super::tenant::{PostgresTenantIsolation, TenantContextWrapper, TenantIsolation};
use crate::config::Config;

pub struct QueueKernel {
    pub db_pool: PgPool,
    pub ledger: Arc<dyn JobLedger>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub spool: Arc<dyn JobSpool>,
    pub broker: Arc<dyn Broker>,
    pub tenant_isolation: Arc<dyn TenantIsolation>,
    pub registry: SharedHandlerRegistry,
    pub queue: Arc<ReliableJobQueue>,
    pub config: Config,
}

impl QueueKernel {
    /// Connect to Postgres and build the Postgres/Redis backed kernel.
    pub async fn connect(config: Config, registry: SharedHandlerRegistry) -> Result<Self> {
        let db_pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to database")?;

        let broker: Arc<dyn Broker> = Arc::new(RedisBroker::new(config.broker())?);

        info!(
            handlers = registry.registered_types().len(),
            "queue kernel connected"
        );

        Ok(Self::with_broker(db_pool, broker, registry, config))
    }

    /// Postgres stores around an existing pool and broker.
    pub fn with_broker(
        db_pool: PgPool,
        broker: Arc<dyn Broker>,
        registry: SharedHandlerRegistry,
        config: Config,
    ) -> Self {
        let dead_letters: Arc<dyn DeadLetterStore> =
            Arc::new(PostgresDeadLetterStore::new(db_pool.clone()));
        let ledger: Arc<dyn JobLedger> = Arc::new(PostgresJobLedger::with_retry_policy(
            db_pool.clone(),
            config.retry_policy(),
        ));
        let spool: Arc<dyn JobSpool> = Arc::new(PostgresJobSpool::new(db_pool.clone()));
        let tenant_isolation: Arc<dyn TenantIsolation> =
            Arc::new(PostgresTenantIsolation::new(db_pool.clone()));
        let queue = Arc::new(ReliableJobQueue::new(
            ledger.clone(),
            dead_letters.clone(),
            config.reliability(),
        ));

        Self {
            db_pool,
            ledger,
            dead_letters,
            spool,
            broker,
            tenant_isolation,
            registry,
            queue,
            config,
        }
    }

    pub fn executor(&self) -> JobExecutor {
        JobExecutor::new(
            self.registry.clone(),
            TenantContextWrapper::new(self.tenant_isolation.clone()),
        )
    }

    pub fn dispatcher(&self) -> JobDispatcher {
        JobDispatcher::new(self.queue.clone(), self.broker.clone(), self.spool.clone())
    }

    pub fn runner(&self) -> JobRunner {
        JobRunner::with_config(self.queue.clone(), self.executor(), self.config.runner())
    }

    pub fn drainer(&self) -> SpoolDrainer {
        SpoolDrainer::new(
            self.spool.clone(),
            self.broker.clone(),
            self.queue.clone(),
            self.executor(),
            self.config.drainer(),
        )
    }

    pub fn broker_worker(&self) -> BrokerWorker {
        BrokerWorker::new(self.broker.clone(), self.queue.clone(), self.executor())
    }

    pub fn reaper(&self) -> StalledJobReaper {
        StalledJobReaper::new(self.queue.clone(), self.spool.clone(), self.config.reaper())
    }

    pub fn admin(&self) -> JobAdmin {
        JobAdmin::new(self.queue.clone(), self.spool.clone())
            .with_fallback_threshold(self.config.spool_fallback_threshold)
    }
}
