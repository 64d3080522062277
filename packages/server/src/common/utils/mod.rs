pub mod idempotency;

pub use idempotency::*;
