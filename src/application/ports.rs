//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::domain::identity::ThrottleKey;
use crate::domain::record::ThrottleState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use thiserror::Error;

/// Boxed error carried by store failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Port for obtaining current time.
///
/// This abstraction allows the application layer to work with time
/// without depending on system clock implementation details.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Failures raised by a store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Waiting for a row lock exceeded the configured timeout
    #[error("timed out waiting for a throttle row lock")]
    LockTimeout,
    /// The store could not be reached or has no free connections
    #[error("store unavailable: {0}")]
    Unavailable(#[source] BoxError),
    /// A locked read found no row, although it was just inserted
    #[error("throttle state for `{0}` is missing")]
    MissingState(ThrottleKey),
    /// Any other backend failure
    #[error("store backend error: {0}")]
    Backend(#[source] BoxError),
}

impl StoreError {
    /// Check if this error is a lock-wait timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::LockTimeout)
    }
}

/// Port for a transactional throttle store.
///
/// The store owns two collections: one `ThrottleState` row per key, unique by
/// constraint, and an append-only list of event timestamps per key.
/// Infrastructure provides concrete implementations (MemoryStore, PgStore).
#[async_trait]
pub trait Store: Send + Sync + Debug {
    /// Transaction handle returned by `begin`.
    type Tx: Transaction;

    /// Open a unit of work.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Read a throttle row without locking it.
    async fn load_state(&self, key: &ThrottleKey) -> Result<Option<ThrottleState>, StoreError>;

    /// Delete events with `occurred_at < cutoff`, optionally for one key only.
    ///
    /// # Returns
    /// The number of deleted events
    async fn purge_events(
        &self,
        cutoff: DateTime<Utc>,
        only: Option<&ThrottleKey>,
    ) -> Result<u64, StoreError>;
}

/// Port for one open unit of work.
///
/// Nothing written through a transaction is visible to others before
/// `commit`. Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// Insert a state row with `last_occurred_at = None` unless one exists.
    ///
    /// Concurrent callers must race safely on the uniqueness constraint.
    ///
    /// # Returns
    /// `true` if this call created the row
    async fn insert_state_if_absent(
        &mut self,
        key: &ThrottleKey,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Read the state row under an exclusive lock held until the transaction ends.
    ///
    /// Blocks while another transaction holds the lock.
    async fn lock_state(&mut self, key: &ThrottleKey) -> Result<ThrottleState, StoreError>;

    /// Timestamps of events for `key` with `occurred_at > after`.
    async fn event_times_after(
        &mut self,
        key: &ThrottleKey,
        after: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;

    /// Append an event.
    async fn insert_event(
        &mut self,
        key: &ThrottleKey,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Set `last_occurred_at` (and `updated_at`) on a locked state row.
    async fn touch_state(
        &mut self,
        key: &ThrottleKey,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Make every write of this transaction visible atomically.
    async fn commit(self) -> Result<(), StoreError>;

    /// Discard every write of this transaction.
    async fn rollback(self) -> Result<(), StoreError>;
}
