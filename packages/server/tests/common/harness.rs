//! Test harness with testcontainers for integration testing.
//!
//! Containers are started once and shared by every test in the binary. Each
//! harness gets its own freshly migrated database, so ledger and spool
//! assertions never see rows from tests running in parallel.

use std::sync::Arc;

use anyhow::{Context, Result};
use relay_core::kernel::broker::{RedisBroker, RedisBrokerConfig};
use relay_core::kernel::jobs::{
    PostgresDeadLetterStore, PostgresJobLedger, PostgresJobSpool, ReliabilityConfig,
    ReliableJobQueue,
};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    /// Server URL without a database name
    pg_base_url: String,
    redis_url: String,
    // Keep containers alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
    _redis: ContainerAsync<Redis>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let pg_base_url = format!("postgresql://postgres:postgres@{}:{}", pg_host, pg_port);

        let redis = Redis::default()
            .start()
            .await
            .context("Failed to start Redis container")?;

        let redis_host = redis.get_host().await?;
        let redis_port = redis.get_host_port_ipv4(6379).await?;
        let redis_url = format!("redis://{}:{}", redis_host, redis_port);

        Ok(Self {
            pg_base_url,
            redis_url,
            _postgres: postgres,
            _redis: redis,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test database plus handles on the shared Redis.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let queue = ctx.queue();
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    /// Database pool - use this for fixtures and direct assertions.
    pub db_pool: PgPool,
    /// URL of this harness's database, for tests that need their own pool
    pub database_url: String,
    pub redis_url: String,
    /// Unique per harness so broker tests do not share lists
    pub redis_prefix: String,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;
        let database = format!("relay_test_{}", Uuid::new_v4().simple());

        let admin = PgPool::connect(&format!("{}/postgres", infra.pg_base_url))
            .await
            .context("Failed to connect to Postgres")?;
        sqlx::query(&format!("CREATE DATABASE {}", database))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let database_url = format!("{}/{}", infra.pg_base_url, database);
        let db_pool = PgPool::connect(&database_url)
            .await
            .context("Failed to connect to test database")?;

        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_pool,
            database_url,
            redis_url: infra.redis_url.clone(),
            redis_prefix: format!("relay:test:{}", Uuid::new_v4().simple()),
        })
    }

    pub fn ledger(&self) -> Arc<PostgresJobLedger> {
        Arc::new(PostgresJobLedger::new(self.db_pool.clone()))
    }

    pub fn dead_letters(&self) -> Arc<PostgresDeadLetterStore> {
        Arc::new(PostgresDeadLetterStore::new(self.db_pool.clone()))
    }

    pub fn spool(&self) -> Arc<PostgresJobSpool> {
        Arc::new(PostgresJobSpool::new(self.db_pool.clone()))
    }

    pub fn queue(&self) -> ReliableJobQueue {
        self.queue_with(ReliabilityConfig::default())
    }

    pub fn queue_with(&self, config: ReliabilityConfig) -> ReliableJobQueue {
        ReliableJobQueue::new(self.ledger(), self.dead_letters(), config)
    }

    pub fn broker(&self) -> RedisBroker {
        RedisBroker::new(RedisBrokerConfig {
            url: self.redis_url.clone(),
            key_prefix: self.redis_prefix.clone(),
            ..Default::default()
        })
        .expect("valid redis url")
    }

    /// Pretend a PROCESSING job started `secs` ago.
    pub async fn backdate_started(&self, job_id: Uuid, secs: i64) {
        sqlx::query(
            "UPDATE jobs SET started_at = NOW() - make_interval(secs => $2) WHERE id = $1",
        )
        .bind(job_id)
        .bind(secs as f64)
        .execute(&self.db_pool)
        .await
        .expect("backdate job");
    }
}
