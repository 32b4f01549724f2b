//! In-process transactional store.
//!
//! `MemoryStore` implements the store port with the same guarantees the
//! engine relies on from a database, but only for callers in one process:
//!
//! - Each `(scope, key)` owns a slot in a `DashMap`. The slot carries an async
//!   mutex (the row lock) and the last committed `ThrottleState`.
//! - A transaction locks a slot on first use and keeps the guard until it
//!   commits or is dropped. Writes go to a private working copy.
//! - `commit` publishes working copies and staged events before releasing any
//!   lock. Rolling back, or dropping the transaction, discards them.
//!
//! A slot whose creating transaction rolled back stays in the map as a lock
//! anchor but has no committed state, so it is invisible to readers.

use crate::application::ports::{Store, StoreError, Transaction};
use crate::domain::identity::ThrottleKey;
use crate::domain::record::{EventRecord, ThrottleState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Default lock wait in milliseconds.
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

fn default_lock_timeout_ms() -> Option<u64> {
    Some(DEFAULT_LOCK_TIMEOUT_MS)
}

/// Configuration for the in-memory store.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryStoreConfig {
    /// Maximum wait for a row lock in milliseconds; `None` waits forever.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: Option<u64>,
}

impl MemoryStoreConfig {
    /// The lock wait as a `Duration`.
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    lock: Arc<Mutex<()>>,
    committed: RwLock<Option<ThrottleState>>,
}

impl Slot {
    fn read(&self) -> Option<ThrottleState> {
        self.committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, state: Option<ThrottleState>) {
        *self
            .committed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = state;
    }
}

#[derive(Debug, Default)]
struct Tables {
    states: DashMap<ThrottleKey, Arc<Slot>>,
    events: DashMap<ThrottleKey, Vec<DateTime<Utc>>>,
}

/// Thread-safe in-memory throttle store.
///
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Tables>,
    config: MemoryStoreConfig,
}

impl MemoryStore {
    /// Create an empty store with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store with custom configuration.
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            tables: Arc::default(),
            config,
        }
    }

    /// Get the store configuration.
    pub fn config(&self) -> &MemoryStoreConfig {
        &self.config
    }

    /// Committed event timestamps for `key`, oldest first.
    pub fn event_times(&self, key: &ThrottleKey) -> Vec<DateTime<Utc>> {
        let mut times = self
            .tables
            .events
            .get(key)
            .map(|times| times.value().clone())
            .unwrap_or_default();
        times.sort_unstable();
        times
    }

    /// Total number of committed events.
    pub fn event_count(&self) -> usize {
        self.tables.events.iter().map(|entry| entry.len()).sum()
    }

    /// Number of committed state rows.
    pub fn state_count(&self) -> usize {
        self.tables
            .states
            .iter()
            .filter(|entry| entry.value().read().is_some())
            .count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        Ok(MemoryTransaction {
            tables: Arc::clone(&self.tables),
            lock_timeout: self.config.lock_timeout(),
            held: HashMap::new(),
            pending_events: Vec::new(),
        })
    }

    async fn load_state(&self, key: &ThrottleKey) -> Result<Option<ThrottleState>, StoreError> {
        let slot = self.tables.states.get(key).map(|slot| slot.value().clone());
        Ok(slot.and_then(|slot| slot.read()))
    }

    async fn purge_events(
        &self,
        cutoff: DateTime<Utc>,
        only: Option<&ThrottleKey>,
    ) -> Result<u64, StoreError> {
        let mut purged = 0u64;
        let mut prune = |times: &mut Vec<DateTime<Utc>>| {
            let before = times.len();
            times.retain(|&at| at >= cutoff);
            purged += (before - times.len()) as u64;
            !times.is_empty()
        };

        match only {
            Some(key) => {
                self.tables
                    .events
                    .remove_if_mut(key, |_, times| !prune(times));
            }
            None => self.tables.events.retain(|_, times| prune(times)),
        }

        Ok(purged)
    }
}

struct HeldRow {
    slot: Arc<Slot>,
    working: Option<ThrottleState>,
    _guard: OwnedMutexGuard<()>,
}

/// Open unit of work on a [`MemoryStore`].
///
/// Dropping it without calling `commit` discards every write and releases
/// its locks.
pub struct MemoryTransaction {
    tables: Arc<Tables>,
    lock_timeout: Option<Duration>,
    held: HashMap<ThrottleKey, HeldRow>,
    pending_events: Vec<EventRecord>,
}

impl MemoryTransaction {
    /// Lock the slot for `key`, creating it if needed.
    async fn acquire(&mut self, key: &ThrottleKey) -> Result<&mut HeldRow, StoreError> {
        match self.held.entry(key.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let slot = self
                    .tables
                    .states
                    .entry(key.clone())
                    .or_default()
                    .value()
                    .clone();
                let lock = Arc::clone(&slot.lock).lock_owned();
                let guard = match self.lock_timeout {
                    Some(limit) => tokio::time::timeout(limit, lock)
                        .await
                        .map_err(|_| StoreError::LockTimeout)?,
                    None => lock.await,
                };
                let working = slot.read();
                Ok(entry.insert(HeldRow {
                    slot,
                    working,
                    _guard: guard,
                }))
            }
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn insert_state_if_absent(
        &mut self,
        key: &ThrottleKey,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = self.acquire(key).await?;
        if row.working.is_some() {
            return Ok(false);
        }
        row.working = Some(ThrottleState::new(key.clone(), now));
        Ok(true)
    }

    async fn lock_state(&mut self, key: &ThrottleKey) -> Result<ThrottleState, StoreError> {
        let row = self.acquire(key).await?;
        row.working
            .clone()
            .ok_or_else(|| StoreError::MissingState(key.clone()))
    }

    async fn event_times_after(
        &mut self,
        key: &ThrottleKey,
        after: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let mut times: Vec<DateTime<Utc>> = self
            .tables
            .events
            .get(key)
            .map(|times| times.iter().copied().filter(|&at| at > after).collect())
            .unwrap_or_default();

        times.extend(
            self.pending_events
                .iter()
                .filter(|event| event.key == *key && event.occurred_at > after)
                .map(|event| event.occurred_at),
        );
        times.sort_unstable();
        Ok(times)
    }

    async fn insert_event(
        &mut self,
        key: &ThrottleKey,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.pending_events.push(EventRecord {
            key: key.clone(),
            occurred_at,
        });
        Ok(())
    }

    async fn touch_state(
        &mut self,
        key: &ThrottleKey,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let row = self.acquire(key).await?;
        match row.working.as_mut() {
            Some(state) => {
                state.touch(occurred_at);
                Ok(())
            }
            None => Err(StoreError::MissingState(key.clone())),
        }
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        for event in self.pending_events.drain(..) {
            self.tables
                .events
                .entry(event.key)
                .or_default()
                .push(event.occurred_at);
        }
        for row in self.held.values_mut() {
            row.slot.publish(row.working.take());
        }
        // Locks are released when `self` drops, after everything is published.
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TimeDelta;

    fn key(scope: &str) -> ThrottleKey {
        ThrottleKey::new(scope, "k").unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_lock() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let k = key("s");

        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_state_if_absent(&k, now).await.unwrap());
        assert!(!tx.insert_state_if_absent(&k, now).await.unwrap());
        assert_eq!(tx.lock_state(&k).await.unwrap().created_at, now);

        // Not visible before commit
        assert_eq!(store.load_state(&k).await.unwrap(), None);
        tx.commit().await.unwrap();

        assert_eq!(store.state_count(), 1);
        assert!(store.load_state(&k).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollback_discards_row_and_events() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let k = key("s");

        let mut tx = store.begin().await.unwrap();
        tx.insert_state_if_absent(&k, now).await.unwrap();
        tx.insert_event(&k, now).await.unwrap();
        tx.touch_state(&k, now).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.state_count(), 0);
        assert_eq!(store.event_count(), 0);

        // The slot is reusable afterwards
        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_state_if_absent(&k, now).await.unwrap());
        tx.commit().await.unwrap();
        assert_eq!(store.state_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_lock() {
        let store = MemoryStore::new();
        let k = key("s");

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_state_if_absent(&k, Utc::now()).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_state_if_absent(&k, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let store = MemoryStore::with_config(MemoryStoreConfig {
            lock_timeout_ms: Some(20),
        });
        let k = key("s");

        let mut holder = store.begin().await.unwrap();
        holder.insert_state_if_absent(&k, Utc::now()).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let err = waiter.lock_state(&k).await.unwrap_err();
        assert!(err.is_timeout());

        // Other keys are unaffected
        assert!(waiter
            .insert_state_if_absent(&key("other"), Utc::now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_event_reads_see_own_writes() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let k = key("s");

        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&k, now - TimeDelta::minutes(5)).await.unwrap();
        tx.insert_event(&k, now - TimeDelta::minutes(90)).await.unwrap();

        let recent = tx
            .event_times_after(&k, now - TimeDelta::hours(1))
            .await
            .unwrap();
        assert_eq!(recent, vec![now - TimeDelta::minutes(5)]);
    }

    #[tokio::test]
    async fn test_staged_events_publish_on_commit() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (a, b) = (key("a"), key("b"));

        let mut tx = store.begin().await.unwrap();
        tx.insert_event(&a, now).await.unwrap();
        tx.insert_event(&b, now - TimeDelta::seconds(1)).await.unwrap();

        let staged = tx
            .event_times_after(&a, now - TimeDelta::minutes(1))
            .await
            .unwrap();
        assert_eq!(staged, vec![now]);
        assert_eq!(store.event_count(), 0);

        tx.commit().await.unwrap();
        assert_eq!(store.event_times(&a), vec![now]);
        assert_eq!(store.event_times(&b), vec![now - TimeDelta::seconds(1)]);
    }

    #[tokio::test]
    async fn test_purge_global_and_scoped() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let (a, b) = (key("a"), key("b"));

        let mut tx = store.begin().await.unwrap();
        for k in [&a, &b] {
            tx.insert_event(k, now - TimeDelta::hours(48)).await.unwrap();
            tx.insert_event(k, now - TimeDelta::hours(12)).await.unwrap();
        }
        tx.commit().await.unwrap();

        let cutoff = now - TimeDelta::hours(24);
        assert_eq!(store.purge_events(cutoff, Some(&a)).await.unwrap(), 1);
        assert_eq!(store.event_times(&b).len(), 2);

        assert_eq!(store.purge_events(cutoff, None).await.unwrap(), 1);
        assert_eq!(store.purge_events(cutoff, None).await.unwrap(), 0);
        assert_eq!(store.event_count(), 2);
    }

    #[test]
    fn test_config_deserialize() {
        let config: MemoryStoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.lock_timeout(), Some(Duration::from_millis(5_000)));

        let config: MemoryStoreConfig =
            serde_json::from_str(r#"{"lock_timeout_ms": null}"#).unwrap();
        assert_eq!(config.lock_timeout(), None);
    }
}
