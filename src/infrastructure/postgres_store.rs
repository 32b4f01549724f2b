//! PostgreSQL-backed store implementation.
//!
//! Shares throttle state between every process connected to the same
//! database. Row locks, uniqueness and atomic commit all come from
//! PostgreSQL itself.
//!
//! ## Schema
//!
//! Two tables, created by [`PgStore::migrate`]:
//! - `throttles`: one row per `(scope, key)`, unique by constraint. Locked
//!   with `SELECT ... FOR UPDATE` for the duration of a decision.
//! - `throttle_events`: append-only admitted occurrences, indexed on
//!   `(scope, key, occurred_at)` for the window range scan.
//!
//! ## Lock waits
//!
//! Every transaction sets a local `lock_timeout`. A decision that waits
//! longer than that for a row lock fails with `StoreError::LockTimeout`
//! instead of hanging.
//!
//! ## Example
//!
//! ```rust,ignore
//! use durable_throttle::{PgStore, Policy, ThrottleEngine, ThrottleRequest, WindowUnit};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = PgStore::connect("postgres://localhost/app")
//!         .await
//!         .expect("Failed to connect to PostgreSQL");
//!     store.migrate().await.expect("Failed to create throttle tables");
//!
//!     let engine = ThrottleEngine::new(store);
//!     let policy = Policy::per(WindowUnit::Hour, 2);
//!     let request = ThrottleRequest::new("user:42", "password-reset", policy);
//!     let outcome = engine.admit(&request).await.unwrap();
//! }
//! ```

use crate::application::ports::{Store, StoreError, Transaction};
use crate::domain::identity::ThrottleKey;
use crate::domain::record::ThrottleState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Postgres;
use std::time::Duration;

/// SQLSTATE for `lock_not_available`, raised when `lock_timeout` fires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Statements creating the throttle tables, safe to run repeatedly.
pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS throttles (
        id BIGSERIAL PRIMARY KEY,
        scope VARCHAR(255) NOT NULL,
        key VARCHAR(255) NOT NULL,
        last_occurred_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        CONSTRAINT throttles_scope_key_unique UNIQUE (scope, key)
    )",
    "CREATE TABLE IF NOT EXISTS throttle_events (
        id BIGSERIAL PRIMARY KEY,
        scope VARCHAR(255) NOT NULL,
        key VARCHAR(255) NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS throttle_events_scope_key_occurred_at
        ON throttle_events (scope, key, occurred_at)",
];

fn default_lock_timeout_ms() -> Option<u64> {
    Some(5_000)
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    3_000
}

/// Configuration for PostgreSQL storage.
#[derive(Debug, Clone, Deserialize)]
pub struct PgStoreConfig {
    /// Per-transaction `lock_timeout` in milliseconds (default: 5000).
    /// `None` leaves the server setting untouched.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: Option<u64>,
    /// Pool size (default: 10)
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Maximum wait for a free pooled connection in milliseconds (default: 3000)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

/// PostgreSQL-backed throttle store.
///
/// Clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    config: PgStoreConfig,
}

impl PgStore {
    /// Connect to PostgreSQL with default configuration.
    ///
    /// # Errors
    /// Returns error if the pool cannot open its first connection.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, PgStoreConfig::default()).await
    }

    /// Connect to PostgreSQL with custom configuration.
    ///
    /// # Errors
    /// Returns error if the pool cannot open its first connection.
    pub async fn connect_with_config(url: &str, config: PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(url)
            .await
            .map_err(map_sqlx_error)?;

        Ok(Self::from_pool(pool, config))
    }

    /// Wrap an existing pool, e.g. the one the application already uses.
    pub fn from_pool(pool: PgPool, config: PgStoreConfig) -> Self {
        Self { pool, config }
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get the store configuration.
    pub fn config(&self) -> &PgStoreConfig {
        &self.config
    }

    /// Create the throttle tables and index if they do not exist.
    ///
    /// # Errors
    /// Returns error if any DDL statement fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        tracing::debug!("throttle schema ready");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        if let Some(ms) = self.config.lock_timeout_ms {
            sqlx::query("SELECT set_config('lock_timeout', $1, true)")
                .bind(format!("{ms}ms"))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        Ok(PgTransaction { tx })
    }

    async fn load_state(&self, key: &ThrottleKey) -> Result<Option<ThrottleState>, StoreError> {
        let row: Option<StateRow> = sqlx::query_as(
            "SELECT last_occurred_at, created_at, updated_at
             FROM throttles WHERE scope = $1 AND key = $2",
        )
        .bind(key.scope())
        .bind(key.key())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(|row| into_state(key, row)))
    }

    async fn purge_events(
        &self,
        cutoff: DateTime<Utc>,
        only: Option<&ThrottleKey>,
    ) -> Result<u64, StoreError> {
        let result = match only {
            Some(key) => {
                sqlx::query(
                    "DELETE FROM throttle_events
                     WHERE scope = $1 AND key = $2 AND occurred_at < $3",
                )
                .bind(key.scope())
                .bind(key.key())
                .bind(cutoff)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query("DELETE FROM throttle_events WHERE occurred_at < $1")
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await
            }
        };

        Ok(result.map_err(map_sqlx_error)?.rows_affected())
    }
}

/// Open database transaction on a [`PgStore`].
///
/// Dropping it without calling `commit` rolls it back when the connection
/// returns to the pool.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    /// The connection carrying this transaction.
    ///
    /// Guarded actions use it to make their own writes atomic with the
    /// throttle bookkeeping.
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn insert_state_if_absent(
        &mut self,
        key: &ThrottleKey,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO throttles (scope, key, last_occurred_at, created_at, updated_at)
             VALUES ($1, $2, NULL, $3, $3)
             ON CONFLICT (scope, key) DO NOTHING",
        )
        .bind(key.scope())
        .bind(key.key())
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn lock_state(&mut self, key: &ThrottleKey) -> Result<ThrottleState, StoreError> {
        let row: Option<StateRow> = sqlx::query_as(
            "SELECT last_occurred_at, created_at, updated_at
             FROM throttles WHERE scope = $1 AND key = $2
             FOR UPDATE",
        )
        .bind(key.scope())
        .bind(key.key())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|row| into_state(key, row))
            .ok_or_else(|| StoreError::MissingState(key.clone()))
    }

    async fn event_times_after(
        &mut self,
        key: &ThrottleKey,
        after: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        sqlx::query_scalar(
            "SELECT occurred_at FROM throttle_events
             WHERE scope = $1 AND key = $2 AND occurred_at > $3
             ORDER BY occurred_at",
        )
        .bind(key.scope())
        .bind(key.key())
        .bind(after)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)
    }

    async fn insert_event(
        &mut self,
        key: &ThrottleKey,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO throttle_events (scope, key, occurred_at) VALUES ($1, $2, $3)")
            .bind(key.scope())
            .bind(key.key())
            .bind(occurred_at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn touch_state(
        &mut self,
        key: &ThrottleKey,
        occurred_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE throttles SET last_occurred_at = $3, updated_at = $3
             WHERE scope = $1 AND key = $2",
        )
        .bind(key.scope())
        .bind(key.key())
        .bind(occurred_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MissingState(key.clone()));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}

type StateRow = (Option<DateTime<Utc>>, DateTime<Utc>, DateTime<Utc>);

fn into_state(
    key: &ThrottleKey,
    (last_occurred_at, created_at, updated_at): StateRow,
) -> ThrottleState {
    ThrottleState {
        key: key.clone(),
        last_occurred_at,
        created_at,
        updated_at,
    }
}

/// Only `lock_timeout` counts; `statement_timeout` and cancels stay backend errors.
fn is_lock_timeout(code: Option<&str>) -> bool {
    code == Some(LOCK_NOT_AVAILABLE)
}

/// Classify a driver error into the store taxonomy.
fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if is_lock_timeout(db.code().as_deref()) => {
            StoreError::LockTimeout
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(Box::new(e))
        }
        _ => StoreError::Backend(Box::new(e)),
    }
}
