//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic against a store:
//! - Throttling engine (locking, evaluation, recording)
//! - Retention (purging old events)
//! - Decision metrics
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod engine;
pub mod metrics;
pub mod ports;
pub mod retention;
