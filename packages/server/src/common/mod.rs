// Common helpers shared across the queue core

pub mod tracing;
pub mod utils;

pub use self::tracing::init_tracing;
pub use utils::*;
