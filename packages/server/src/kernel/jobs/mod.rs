//! Reliable job delivery.
//!
//! - [`PostgresJobLedger`] - durable priority ledger (source of truth)
//! - [`ReliableJobQueue`] - idempotent submission, circuit breakers, DLQ routing
//! - [`PostgresDeadLetterStore`] - terminal failures awaiting review
//! - [`PostgresJobSpool`] - fallback storage while the broker is down
//! - [`SpoolDrainer`] - moves spooled jobs back to the broker, or runs them inline
//! - [`JobRunner`] / [`BrokerWorker`] - long-running consumers
//!
//! # Architecture
//!
//! ```text
//! submit ──► ReliableJobQueue ──► JobLedger ──► JobRunner ──► JobExecutor
//!                  │                                              │
//!                  └─► DeadLetterStore ◄─── exhausted / permanent ┘
//!
//! dispatch ──► ReliableJobQueue::submit ──► Broker (job id) ──► BrokerWorker
//!     └─(broker down)─► JobSpool ──► SpoolDrainer ──► Broker | inline
//! ```
//!
//! The broker and the spool only say which ledger job to run. Every consumer
//! claims through the ledger and settles with `record_outcome`, so a lost
//! broker message leaves a PENDING row the runner still picks up.
//!
//! Handlers themselves live with the application; this module only
//! provides the delivery machinery.

pub mod admin;
pub mod broker_worker;
pub mod circuit_breaker;
pub mod dead_letter;
pub mod drainer;
pub mod error;
pub mod executor;
pub mod job;
pub mod ledger;
pub mod payload;
pub mod reaper;
pub mod registry;
pub mod reliability;
pub mod runner;
pub mod spool;
pub mod testing;

pub use admin::{DashboardStats, JobAdmin};
pub use broker_worker::{BrokerJobResult, BrokerWorker, MALFORMED_BROKER_MESSAGE};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakers, CircuitSnapshot};
pub use dead_letter::{
    DeadLetterEntry, DeadLetterStore, NewDeadLetterEntry, PostgresDeadLetterStore, ReviewAction,
    ReviewUpdate,
};
pub use drainer::{BrokerHealth, CycleReport, DrainerConfig, DrainerStats, SpoolDrainer};
pub use error::{classify_error, ErrorKind, JobError};
pub use executor::JobExecutor;
pub use job::{
    ClaimFilter, EnqueueResult, FailOutcome, Job, JobPriority, JobStats, JobStatus, NewJob,
    RetryPolicy, SubmitOptions, DEFAULT_MAX_ATTEMPTS,
};
pub use ledger::{JobLedger, PostgresJobLedger};
pub use payload::JobPayload;
pub use reaper::{ReaperConfig, ReaperReport, StalledJobReaper};
pub use registry::{HandlerRegistry, HandlerResult, JobContext, JobOutcome, SharedHandlerRegistry};
pub use reliability::{JobClaim, JobDisposition, ReliabilityConfig, ReliableJobQueue};
pub use runner::{JobRunner, JobRunnerConfig};
pub use spool::{JobSpool, PostgresJobSpool, SpoolRequest, SpooledJob, DEFAULT_FALLBACK_THRESHOLD};
