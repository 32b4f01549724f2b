//! # durable-throttle
//!
//! Store-backed, multi-window throttling with single-winner semantics.
//!
//! This crate decides whether a guarded action for a `(scope, key)` pair may
//! run now, given a policy such as "at most 2 per hour and 5 per day". When
//! the action runs, its occurrence is recorded in the same transaction as the
//! action's own writes, so concurrent callers, even in different processes
//! sharing a database, never admit more occurrences than the policy allows.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use durable_throttle::{MemoryStore, Policy, ThrottleEngine, ThrottleRequest, WindowUnit};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = ThrottleEngine::new(MemoryStore::new());
//!
//! let policy = Policy::builder()
//!     .per(WindowUnit::Hour, 2)
//!     .per(WindowUnit::Day, 5)
//!     .build()?;
//! let request = ThrottleRequest::new("user:42", "password-reset", policy);
//!
//! let outcome = engine
//!     .decide(&request, |_tx| {
//!         Box::pin(async {
//!             // send the email here
//!             Ok::<_, std::io::Error>("queued")
//!         })
//!     })
//!     .await?;
//!
//! if outcome.is_throttled() {
//!     println!("try again later");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! ### Policies
//! - **Multiple windows**: one limit per unit (second, minute, hour, day, week)
//! - **Most restrictive wins**: an occurrence is admitted only if every window has room
//! - **Sliding windows**: each window covers `(now - period, now]`, re-evaluated on every decision
//!
//! ### Decisions
//! - **Single winner**: decisions for the same key are serialized by a row lock
//! - **Atomic recording**: the action's writes and the recorded occurrence commit together
//! - **Rollback on failure**: a failing action leaves no trace in the throttle history
//! - **Force**: skip the check for one request while still recording it
//!
//! ### Stores
//! - [`MemoryStore`]: in-process, for tests and single-instance services
//! - `PgStore` (feature `postgres`): PostgreSQL via `sqlx`, shared across processes
//!
//! ## Policies from configuration
//!
//! Policies deserialize from a map of unit to limit:
//!
//! ```rust
//! use durable_throttle::{Policy, WindowUnit};
//!
//! let policy: Policy = serde_json::from_str(r#"{"hour": 2, "day": 5}"#).unwrap();
//! assert_eq!(policy.to_string(), "2/hour, 5/day");
//! assert_eq!(policy.longest_period(), Some(WindowUnit::Day.duration()));
//! ```
//!
//! ## Transactional actions
//!
//! The action receives the store transaction. With the `postgres` feature,
//! [`PgTransaction::connection`](infrastructure::postgres_store::PgTransaction)
//! exposes the connection, so the action's inserts commit or roll back with
//! the throttle bookkeeping:
//!
//! ```rust,ignore
//! let outcome = engine
//!     .decide(&request, |tx| {
//!         Box::pin(async move {
//!             sqlx::query("INSERT INTO outbox (kind) VALUES ('digest')")
//!                 .execute(tx.connection())
//!                 .await
//!         })
//!     })
//!     .await?;
//! ```
//!
//! ## Errors
//!
//! Throttling and action failures are ordinary outcomes:
//!
//! - [`Outcome::Admitted`]: the action ran and everything committed
//! - [`Outcome::Throttled`]: a window was full; nothing ran
//! - [`Outcome::Failed`]: the action returned an error; everything rolled back
//!
//! Invalid requests and store failures are returned as [`ThrottleError`].
//!
//! ## Retention
//!
//! Events accumulate until purged. Purging never touches state rows:
//!
//! ```rust,no_run
//! # use durable_throttle::{MemoryStore, Policy, ThrottleEngine, WindowUnit};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let engine = ThrottleEngine::new(MemoryStore::new());
//! let longest = Policy::per(WindowUnit::Week, 10);
//! let purged = engine.purge_for_policy(&longest).await?;
//! println!("purged {purged} events");
//! # Ok(())
//! # }
//! ```
//!
//! ## Observability
//!
//! Decisions are logged through `tracing` and counted in [`Metrics`]:
//!
//! ```rust,no_run
//! # use durable_throttle::{MemoryStore, ThrottleEngine};
//! # let engine = ThrottleEngine::new(MemoryStore::new());
//! let snapshot = engine.metrics().snapshot();
//! println!("Throttle rate: {:.2}%", snapshot.throttle_rate() * 100.0);
//! ```

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    identity::{IdentityError, ThrottleKey, MAX_IDENTIFIER_LEN},
    policy::{Policy, PolicyBuilder, PolicyDecision, PolicyError, Window, WindowUnit},
    record::{EventRecord, ThrottleState},
};

pub use application::{
    engine::{ConfigurationError, Outcome, ThrottleEngine, ThrottleError, ThrottleRequest},
    metrics::{Metrics, MetricsSnapshot},
    ports::{Clock, Store, StoreError, Transaction},
    retention::{self, RETENTION_MARGIN},
};

pub use infrastructure::{
    clock::SystemClock,
    memory_store::{MemoryStore, MemoryStoreConfig, MemoryTransaction},
};

#[cfg(feature = "postgres")]
pub use infrastructure::postgres_store::{PgStore, PgStoreConfig, PgTransaction};
