//! Consumer for jobs announced on the broker.
//!
//! A broker message only names a ledger job. The worker claims that job by id
//! through the reliability layer and settles it with `record_outcome`, so
//! retries, circuit breakers and dead-lettering behave exactly as for jobs
//! the runner polls. A message whose job is already settled, running
//! elsewhere or waiting on an open breaker is skipped; the ledger still owns
//! the job. A body that does not decode is dead-lettered as-is.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::dead_letter::NewDeadLetterEntry;
use super::executor::JobExecutor;
use super::job::JobPriority;
use super::reliability::{JobClaim, JobDisposition, ReliableJobQueue};
use crate::kernel::broker::{Broker, BrokerDelivery, BrokerJob};

/// Job type recorded for broker messages that could not be decoded.
pub const MALFORMED_BROKER_MESSAGE: &str = "broker.malformed";

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerJobResult {
    /// Claimed, executed and settled in the ledger
    Processed(JobDisposition),
    /// Nothing to do for this message right now
    Skipped,
    /// Undecodable message, now in the dead letter store
    Poisoned,
}

pub struct BrokerWorker {
    broker: Arc<dyn Broker>,
    queue: Arc<ReliableJobQueue>,
    executor: JobExecutor,
    idle_interval: Duration,
}

impl BrokerWorker {
    pub fn new(broker: Arc<dyn Broker>, queue: Arc<ReliableJobQueue>, executor: JobExecutor) -> Self {
        Self {
            broker,
            queue,
            executor,
            idle_interval: Duration::from_secs(1),
        }
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    /// Pop and handle one message. `None` if the broker had nothing.
    pub async fn process_one(&self) -> Result<Option<BrokerJobResult>> {
        let Some(delivery) = self.broker.dequeue().await? else {
            return Ok(None);
        };

        let result = match delivery {
            BrokerDelivery::Job(envelope) => self.handle(envelope).await?,
            BrokerDelivery::Malformed {
                queue,
                priority,
                body,
                error,
            } => {
                self.queue
                    .dead_letter_orphan(malformed_dead_letter(&queue, priority, &body, &error))
                    .await?;
                BrokerJobResult::Poisoned
            }
        };
        Ok(Some(result))
    }

    async fn handle(&self, envelope: BrokerJob) -> Result<BrokerJobResult> {
        let job = match self.queue.claim(envelope.job_id).await? {
            JobClaim::Claimed(job) => job,
            JobClaim::Unavailable(job) => {
                debug!(job_id = %job.id, job_type = %job.job_type, status = %job.status, "broker job not claimable now");
                return Ok(BrokerJobResult::Skipped);
            }
            JobClaim::Settled(job) => {
                debug!(job_id = %job.id, status = %job.status, "broker job already settled");
                return Ok(BrokerJobResult::Skipped);
            }
            JobClaim::Missing => {
                error!(job_id = %envelope.job_id, job_type = %envelope.job_type, "broker message for unknown job");
                return Ok(BrokerJobResult::Skipped);
            }
        };

        let outcome = self.executor.execute_job(&job).await;
        let disposition = self.queue.record_outcome(&job, outcome).await?;
        Ok(BrokerJobResult::Processed(disposition))
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("broker worker starting");

        while !shutdown.is_cancelled() {
            let delay = match self.process_one().await {
                Ok(Some(_)) => None,
                Ok(None) => Some(self.idle_interval),
                Err(e) => {
                    error!(error = %e, "broker worker cycle failed");
                    Some(self.idle_interval)
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!("broker worker stopped");
        Ok(())
    }
}

/// Dead letter entry preserving an undecodable broker body under a fresh id.
pub fn malformed_dead_letter(queue: &str, priority: JobPriority, body: &str, error: &str) -> NewDeadLetterEntry {
    let last_error = format!("malformed broker message on {}: {}", queue, error);
    NewDeadLetterEntry {
        original_job_id: Uuid::now_v7(),
        job_type: MALFORMED_BROKER_MESSAGE.to_string(),
        payload: json!({ "queue": queue, "body": body }),
        priority,
        error_history: vec![last_error.clone()],
        last_error,
        attempts: 0,
        requires_manual_review: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::{JobStatus, SubmitOptions};
    use crate::kernel::jobs::ledger::JobLedger;
    use crate::kernel::jobs::registry::{HandlerRegistry, JobContext, JobOutcome};
    use crate::kernel::jobs::reliability::ReliabilityConfig;
    use crate::kernel::jobs::testing::{MemoryDeadLetterStore, MemoryJobLedger, TestBroker};
    use crate::kernel::tenant::{NoopTenantIsolation, TenantContextWrapper};
    use serde_json::json;

    struct Fixture {
        broker: Arc<TestBroker>,
        ledger: Arc<MemoryJobLedger>,
        dead_letters: Arc<MemoryDeadLetterStore>,
        queue: Arc<ReliableJobQueue>,
        worker: BrokerWorker,
    }

    fn fixture(outcome: fn() -> JobOutcome) -> Fixture {
        let broker = Arc::new(TestBroker::new());
        let dead_letters = Arc::new(MemoryDeadLetterStore::default());
        let ledger = Arc::new(MemoryJobLedger::new(dead_letters.clone()));
        let queue = Arc::new(ReliableJobQueue::new(
            ledger.clone(),
            dead_letters.clone(),
            ReliabilityConfig::default(),
        ));

        let mut registry = HandlerRegistry::new();
        registry.register("sync.contact", move |_ctx: JobContext| async move { Ok(outcome()) });
        let executor = JobExecutor::new(
            Arc::new(registry),
            TenantContextWrapper::new(Arc::new(NoopTenantIsolation)),
        );

        let worker = BrokerWorker::new(broker.clone(), queue.clone(), executor);
        Fixture {
            broker,
            ledger,
            dead_letters,
            queue,
            worker,
        }
    }

    impl Fixture {
        /// Submit to the ledger and announce on the broker, as the dispatcher does.
        async fn announce(&self, max_attempts: i32) -> Uuid {
            let job = self
                .queue
                .submit_raw(
                    "sync.contact",
                    json!({ "id": 1 }),
                    SubmitOptions::builder().max_attempts(max_attempts).build(),
                )
                .await
                .unwrap()
                .into_job();
            self.broker.enqueue(&BrokerJob::for_job(&job)).await.unwrap();
            job.id
        }

        async fn status(&self, id: Uuid) -> JobStatus {
            self.ledger.get_job(id).await.unwrap().unwrap().status
        }
    }

    #[tokio::test]
    async fn empty_broker_yields_none() {
        let f = fixture(JobOutcome::completed);
        assert_eq!(f.worker.process_one().await.unwrap(), None);
    }

    #[tokio::test]
    async fn completes_through_the_ledger() {
        let f = fixture(JobOutcome::completed);
        let id = f.announce(3).await;

        let result = f.worker.process_one().await.unwrap();

        assert_eq!(result, Some(BrokerJobResult::Processed(JobDisposition::Completed)));
        assert_eq!(f.status(id).await, JobStatus::Completed);
        assert_eq!(f.ledger.get_job(id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_by_the_ledger() {
        let f = fixture(|| JobOutcome::retry("crm timeout"));
        let id = f.announce(3).await;

        let result = f.worker.process_one().await.unwrap();

        assert!(matches!(
            result,
            Some(BrokerJobResult::Processed(JobDisposition::Retrying { .. }))
        ));
        assert_eq!(f.status(id).await, JobStatus::Retrying);
        assert!(f.broker.is_empty());
        let breaker = f
            .queue
            .breakers()
            .snapshot()
            .into_iter()
            .find(|s| s.job_type == "sync.contact")
            .unwrap();
        assert_eq!(breaker.failure_count, 1);
    }

    #[tokio::test]
    async fn exhausted_job_is_dead_lettered_by_the_ledger() {
        let f = fixture(|| JobOutcome::retry("crm timeout"));
        let id = f.announce(1).await;

        let result = f.worker.process_one().await.unwrap();

        assert!(matches!(
            result,
            Some(BrokerJobResult::Processed(JobDisposition::DeadLettered { entry_id: Some(_) }))
        ));
        assert_eq!(f.status(id).await, JobStatus::Dlq);
        let entries = f.dead_letters.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].original_job_id, id);
        assert_eq!(entries[0].attempts, 1);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let f = fixture(|| JobOutcome::dead_letter("invalid contact"));
        let id = f.announce(3).await;

        f.worker.process_one().await.unwrap();

        assert_eq!(f.status(id).await, JobStatus::Dlq);
        assert_eq!(f.dead_letters.entries()[0].last_error, "invalid contact");
    }

    #[tokio::test]
    async fn duplicate_message_for_settled_job_is_skipped() {
        let f = fixture(JobOutcome::completed);
        let id = f.announce(3).await;
        let job = f.ledger.get_job(id).await.unwrap().unwrap();
        f.broker.enqueue(&BrokerJob::for_job(&job)).await.unwrap();

        f.worker.process_one().await.unwrap();
        let second = f.worker.process_one().await.unwrap();

        assert_eq!(second, Some(BrokerJobResult::Skipped));
        assert_eq!(f.ledger.get_job(id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn message_for_unknown_job_is_skipped() {
        let f = fixture(JobOutcome::completed);
        f.broker
            .enqueue(&BrokerJob::new(Uuid::now_v7(), "sync.contact"))
            .await
            .unwrap();

        assert_eq!(f.worker.process_one().await.unwrap(), Some(BrokerJobResult::Skipped));
        assert!(f.dead_letters.entries().is_empty());
    }

    #[tokio::test]
    async fn open_circuit_leaves_job_pending() {
        let f = fixture(JobOutcome::completed);
        let id = f.announce(3).await;
        for _ in 0..ReliabilityConfig::default().circuit_breaker.failure_threshold {
            f.queue.breakers().record_failure("sync.contact");
        }

        assert_eq!(f.worker.process_one().await.unwrap(), Some(BrokerJobResult::Skipped));
        assert_eq!(f.status(id).await, JobStatus::Pending);
    }

    #[tokio::test]
    async fn dropped_message_is_still_served_by_the_ledger() {
        let f = fixture(JobOutcome::completed);
        let id = f.announce(3).await;

        // Popped by a consumer that died before claiming
        f.broker.dequeue().await.unwrap().unwrap();
        assert_eq!(f.status(id).await, JobStatus::Pending);

        let processed = f.queue.process_next(&f.worker.executor, None).await.unwrap().unwrap();
        assert_eq!(processed.job_id, id);
        assert_eq!(f.status(id).await, JobStatus::Completed);
    }

    #[tokio::test]
    async fn undecodable_message_is_dead_lettered() {
        let f = fixture(JobOutcome::completed);
        f.broker.push_raw(JobPriority::High, "{\"job_id\": 42");

        let result = f.worker.process_one().await.unwrap();

        assert_eq!(result, Some(BrokerJobResult::Poisoned));
        assert!(f.broker.is_empty());
        let entries = f.dead_letters.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_type, MALFORMED_BROKER_MESSAGE);
        assert_eq!(entries[0].payload["body"], "{\"job_id\": 42");
        assert_eq!(entries[0].priority, JobPriority::High);
        assert!(entries[0].requires_manual_review);
        assert!(entries[0].last_error.starts_with("malformed broker message on high"));
    }
}
