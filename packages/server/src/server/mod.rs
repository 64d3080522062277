// Long-running services (runner, drainer, broker worker, reaper)
mod host;

pub use host::{HostServices, WorkerHost};
