// Relay job delivery core
//
// Durable priority ledger, reliability layer (idempotency, circuit breakers,
// dead-letter routing), broker fallback spool and the services that drain
// them. Handlers are registered by the embedding application.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
