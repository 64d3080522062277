//! Broker adapter and fallback dispatch.
//!
//! The broker (Redis) is an accelerant, never the source of truth. Every
//! dispatched job is written to the ledger first; the broker only carries a
//! small envelope telling consumers which ledger job to claim. Losing a
//! message therefore loses nothing: the ledger runner still finds the job.
//! When the broker cannot take an envelope, [`JobDispatcher`] spools the job
//! so the drainer can hand it over once the broker is back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::jobs::error::JobError;
use super::jobs::job::{EnqueueResult, Job, JobPriority, SubmitOptions};
use super::jobs::payload::JobPayload;
use super::jobs::reliability::ReliableJobQueue;
use super::jobs::spool::{JobSpool, SpoolRequest, SpooledJob};

/// Envelope carried by the broker: which ledger job to claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerJob {
    pub job_id: Uuid,
    pub job_type: String,
    #[serde(default)]
    pub priority: JobPriority,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl BrokerJob {
    pub fn new(job_id: Uuid, job_type: impl Into<String>) -> Self {
        Self {
            job_id,
            job_type: job_type.into(),
            priority: JobPriority::Normal,
            tenant_id: None,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            priority: job.priority,
            tenant_id: job.tenant_id().map(str::to_string),
            enqueued_at: Utc::now(),
        }
    }

    /// Envelope for a spool row. The row's own payload copy is not needed.
    pub fn from_spooled(spooled: &SpooledJob) -> Self {
        Self {
            job_id: spooled.job_id,
            job_type: spooled.job_type.clone(),
            priority: spooled.priority,
            tenant_id: spooled.tenant_id.clone(),
            enqueued_at: Utc::now(),
        }
    }
}

/// One message popped from the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerDelivery {
    Job(BrokerJob),
    /// Body that did not decode. It is already off the queue, so the caller
    /// must record it somewhere.
    Malformed {
        queue: String,
        priority: JobPriority,
        body: String,
        error: String,
    },
}

impl BrokerDelivery {
    pub fn decode(queue: &str, priority: JobPriority, body: String) -> Self {
        match serde_json::from_str::<BrokerJob>(&body) {
            Ok(job) => BrokerDelivery::Job(job),
            Err(e) => {
                error!(queue = %queue, error = %e, body = %body, "malformed broker message");
                BrokerDelivery::Malformed {
                    queue: queue.to_string(),
                    priority,
                    body,
                    error: e.to_string(),
                }
            }
        }
    }
}

/// Minimal queue operations over the in-memory broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Cheap liveness probe.
    async fn ping(&self) -> Result<()>;

    async fn enqueue(&self, job: &BrokerJob) -> Result<()>;

    /// Pop the most urgent message, if any.
    async fn dequeue(&self) -> Result<Option<BrokerDelivery>>;
}

#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub url: String,
    pub key_prefix: String,
    /// Upper bound for connecting and for each command
    pub op_timeout: Duration,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "relay:jobs".to_string(),
            op_timeout: Duration::from_secs(2),
        }
    }
}

/// Redis lists, one per priority.
pub struct RedisBroker {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
    config: RedisBrokerConfig,
}

impl RedisBroker {
    /// Does not connect; the connection is established on first use so the
    /// process can start while Redis is down.
    pub fn new(config: RedisBrokerConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .with_context(|| format!("invalid redis url {}", config.url))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            config,
        })
    }

    pub fn queue_key(&self, priority: JobPriority) -> String {
        format!("{}:{}", self.config.key_prefix, priority.as_str())
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(
            self.config.op_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        .map_err(|_| JobError::BrokerUnavailable("connect timed out".into()))?
        .map_err(|e| JobError::BrokerUnavailable(e.to_string()))?;

        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(JobError::BrokerUnavailable(format!("{} failed: {}", op, e)).into()),
            Err(_) => Err(JobError::BrokerUnavailable(format!("{} timed out", op)).into()),
        }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let reply: String = self
            .bounded("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        if reply != "PONG" {
            return Err(anyhow!("unexpected PING reply {:?}", reply));
        }
        Ok(())
    }

    async fn enqueue(&self, job: &BrokerJob) -> Result<()> {
        let body = serde_json::to_string(job)?;
        let key = self.queue_key(job.priority);
        let mut conn = self.connection().await?;

        let _: i64 = self
            .bounded(
                "LPUSH",
                redis::cmd("LPUSH").arg(&key).arg(&body).query_async(&mut conn),
            )
            .await?;

        debug!(job_id = %job.job_id, job_type = %job.job_type, queue = %key, "job enqueued to broker");
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<BrokerDelivery>> {
        let mut conn = self.connection().await?;

        for priority in JobPriority::all() {
            let key = self.queue_key(priority);
            let body: Option<String> = self
                .bounded("RPOP", redis::cmd("RPOP").arg(&key).query_async(&mut conn))
                .await?;
            if let Some(body) = body {
                return Ok(Some(BrokerDelivery::decode(&key, priority, body)));
            }
        }

        Ok(None)
    }
}

/// Where a dispatched job went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchRoute {
    Broker,
    /// Broker unavailable; the job is in the fallback spool
    Spooled,
    /// Same idempotency key inside the dedup window; nothing was enqueued
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct Dispatched {
    /// The ledger row, existing one for a duplicate
    pub job: Job,
    pub route: DispatchRoute,
}

/// Submits jobs to the ledger and announces them on the broker, falling back
/// to the spool.
#[derive(Clone)]
pub struct JobDispatcher {
    queue: Arc<ReliableJobQueue>,
    broker: Arc<dyn Broker>,
    spool: Arc<dyn JobSpool>,
    enqueue_timeout: Duration,
}

impl JobDispatcher {
    pub fn new(queue: Arc<ReliableJobQueue>, broker: Arc<dyn Broker>, spool: Arc<dyn JobSpool>) -> Self {
        Self {
            queue,
            broker,
            spool,
            enqueue_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Submit through the reliability layer, then route the new job.
    /// Duplicates are returned without touching the broker.
    pub async fn dispatch(&self, payload: JobPayload, options: SubmitOptions) -> Result<Dispatched> {
        let job = match self.queue.submit(payload, options).await? {
            EnqueueResult::Created(job) => job,
            EnqueueResult::Duplicate(job) => {
                return Ok(Dispatched {
                    job,
                    route: DispatchRoute::Duplicate,
                })
            }
        };

        let route = self.route(&job).await?;
        Ok(Dispatched { job, route })
    }

    /// [`dispatch`](Self::dispatch) from an untyped `(type, payload)` pair.
    pub async fn dispatch_raw(
        &self,
        job_type: &str,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<Dispatched> {
        let payload = JobPayload::from_parts(job_type, payload)?;
        self.dispatch(payload, options).await
    }

    /// Announce a ledger job on the broker, or spool it.
    ///
    /// Spool errors propagate: at that point the fallback path cannot take
    /// the job, although its ledger row is still in place for the runner.
    pub async fn route(&self, job: &Job) -> Result<DispatchRoute> {
        let envelope = BrokerJob::for_job(job);
        let failure = match tokio::time::timeout(self.enqueue_timeout, self.broker.enqueue(&envelope)).await {
            Ok(Ok(())) => return Ok(DispatchRoute::Broker),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "enqueue timed out".to_string(),
        };

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            error = %failure,
            "broker unavailable; spooling job"
        );

        self.spool.spool_job(SpoolRequest::for_job(job)).await?;
        Ok(DispatchRoute::Spooled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::JobStatus;
    use crate::kernel::jobs::ledger::JobLedger;
    use crate::kernel::jobs::reliability::ReliabilityConfig;
    use crate::kernel::jobs::testing::{MemoryDeadLetterStore, MemoryJobLedger, MemorySpool, TestBroker};
    use serde_json::json;

    struct Fixture {
        ledger: Arc<MemoryJobLedger>,
        broker: Arc<TestBroker>,
        spool: Arc<MemorySpool>,
        dispatcher: JobDispatcher,
    }

    fn fixture() -> Fixture {
        let dead_letters = Arc::new(MemoryDeadLetterStore::default());
        let ledger = Arc::new(MemoryJobLedger::new(dead_letters.clone()));
        let queue = Arc::new(ReliableJobQueue::new(
            ledger.clone(),
            dead_letters,
            ReliabilityConfig::default(),
        ));
        let broker = Arc::new(TestBroker::new());
        let spool = Arc::new(MemorySpool::new());
        let dispatcher = JobDispatcher::new(queue, broker.clone(), spool.clone());
        Fixture {
            ledger,
            broker,
            spool,
            dispatcher,
        }
    }

    fn notification() -> Value {
        json!({ "tenant_id": "t-3", "user_id": "u-1", "kind": "digest" })
    }

    #[test]
    fn envelope_carries_ledger_identity_only() {
        let job = Job::from_new(
            crate::kernel::jobs::job::NewJob::builder()
                .job_type("notification")
                .payload(notification())
                .priority(JobPriority::High)
                .build(),
        );
        let envelope = BrokerJob::for_job(&job);

        assert_eq!(envelope.job_id, job.id);
        assert_eq!(envelope.priority, JobPriority::High);
        assert_eq!(envelope.tenant_id.as_deref(), Some("t-3"));
        let body = serde_json::to_value(&envelope).unwrap();
        assert!(body.get("payload").is_none());
    }

    #[test]
    fn envelope_defaults_missing_fields() {
        let job: BrokerJob = serde_json::from_value(json!({
            "job_id": Uuid::now_v7(),
            "job_type": "notification",
            "enqueued_at": Utc::now(),
        }))
        .unwrap();
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.tenant_id, None);
    }

    #[test]
    fn undecodable_body_is_surfaced() {
        let delivery = BrokerDelivery::decode("relay:jobs:high", JobPriority::High, "{oops".into());
        match delivery {
            BrokerDelivery::Malformed { queue, priority, body, .. } => {
                assert_eq!(queue, "relay:jobs:high");
                assert_eq!(priority, JobPriority::High);
                assert_eq!(body, "{oops");
            }
            other => panic!("expected malformed delivery, got {:?}", other),
        }
    }

    #[test]
    fn queue_keys_are_per_priority() {
        let broker = RedisBroker::new(RedisBrokerConfig::default()).unwrap();
        assert_eq!(broker.queue_key(JobPriority::Critical), "relay:jobs:critical");
        assert_eq!(broker.queue_key(JobPriority::Low), "relay:jobs:low");
    }

    #[tokio::test]
    async fn dispatch_writes_ledger_then_broker() {
        let f = fixture();

        let dispatched = f
            .dispatcher
            .dispatch_raw("notification", notification(), SubmitOptions::default())
            .await
            .unwrap();

        assert_eq!(dispatched.route, DispatchRoute::Broker);
        let stored = f.ledger.get_job(dispatched.job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(f.broker.jobs()[0].job_id, dispatched.job.id);
        assert_eq!(f.spool.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_dispatch_is_deduplicated() {
        let f = fixture();

        let first = f
            .dispatcher
            .dispatch_raw("notification", notification(), SubmitOptions::default())
            .await
            .unwrap();
        let second = f
            .dispatcher
            .dispatch_raw("notification", notification(), SubmitOptions::default())
            .await
            .unwrap();

        assert_eq!(second.route, DispatchRoute::Duplicate);
        assert_eq!(second.job.id, first.job.id);
        assert_eq!(f.broker.len(), 1);
        assert_eq!(f.ledger.len(), 1);
    }

    #[tokio::test]
    async fn lost_broker_message_leaves_job_in_ledger() {
        let f = fixture();
        let dispatched = f
            .dispatcher
            .dispatch_raw("notification", notification(), SubmitOptions::default())
            .await
            .unwrap();

        // Popped and dropped, as by a consumer that crashed
        f.broker.dequeue().await.unwrap().unwrap();
        assert!(f.broker.is_empty());

        let next = f
            .ledger
            .get_next_job(&crate::kernel::jobs::job::ClaimFilter::any())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, dispatched.job.id);
    }

    #[tokio::test]
    async fn dispatch_spools_when_broker_is_down() {
        let f = fixture();
        f.broker.set_healthy(false);

        let dispatched = f
            .dispatcher
            .dispatch_raw(
                "notification",
                notification(),
                SubmitOptions::builder().priority(JobPriority::High).build(),
            )
            .await
            .unwrap();

        assert_eq!(dispatched.route, DispatchRoute::Spooled);
        assert!(f.broker.is_empty());
        let claimed = f.spool.get_next_jobs(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job_id, dispatched.job.id);
        assert_eq!(claimed[0].priority, JobPriority::High);
        assert_eq!(claimed[0].tenant_id.as_deref(), Some("t-3"));
    }
}
