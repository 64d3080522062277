//! Kernel module - delivery infrastructure and dependencies.

pub mod broker;
pub mod jobs;
mod queue_kernel;
pub mod tenant;

pub use broker::{
    Broker, BrokerDelivery, BrokerJob, DispatchRoute, Dispatched, JobDispatcher, RedisBroker,
    RedisBrokerConfig,
};
pub use queue_kernel::QueueKernel;
pub use tenant::{
    current_tenant, tenant_connection, NoopTenantIsolation, PostgresTenantIsolation,
    TenantContextWrapper, TenantIsolation,
};
