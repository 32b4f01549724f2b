//! Throttling engine.
//!
//! The engine decides whether a guarded action may run for a `(scope, key)`
//! and, when it does run, records the occurrence in the same transaction.
//!
//! # Protocol
//!
//! Every decision runs inside one store transaction:
//!
//! 1. Insert the state row if it does not exist, then re-read it under an
//!    exclusive row lock. Decisions for the same key queue up here; decisions
//!    for different keys never wait on each other.
//! 2. Unless the request is forced, read event timestamps newer than the
//!    policy's oldest cutoff and evaluate every window.
//! 3. If admitted, run the action, insert the event and update the state row,
//!    then commit. If denied, or the action fails, roll back.
//!
//! Because the lock is held until commit, the event written by one admitted
//! decision is always visible to the next decision for that key.

use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Store, StoreError, Transaction};
use crate::domain::identity::{IdentityError, ThrottleKey};
use crate::domain::policy::{Policy, PolicyDecision};
use crate::domain::record::ThrottleState;
use crate::infrastructure::clock::SystemClock;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result of a throttling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    /// The action ran and its occurrence was committed
    Admitted(T),
    /// A window was full; nothing ran and nothing was written
    Throttled,
    /// The action returned an error; its transaction was rolled back
    Failed(E),
}

impl<T, E> Outcome<T, E> {
    /// Check if the action ran and was committed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Outcome::Admitted(_))
    }

    /// Check if the decision was throttled.
    pub fn is_throttled(&self) -> bool {
        matches!(self, Outcome::Throttled)
    }

    /// Check if the action failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// The action's value, if it was admitted.
    pub fn admitted(self) -> Option<T> {
        match self {
            Outcome::Admitted(value) => Some(value),
            _ => None,
        }
    }
}

/// Caller errors detected before the store is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// A non-forced request had no windows to evaluate
    #[error("policy has no windows; only forced requests may omit them")]
    EmptyPolicy,
    /// The scope or key was malformed
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Hard failures of a decision.
///
/// Throttling and action failures are not errors; they are reported through
/// [`Outcome`].
#[derive(Debug, Error)]
pub enum ThrottleError {
    /// The request was invalid
    #[error("invalid throttle request: {0}")]
    Configuration(#[from] ConfigurationError),
    /// The store failed; the transaction was rolled back
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<IdentityError> for ThrottleError {
    fn from(e: IdentityError) -> Self {
        ThrottleError::Configuration(e.into())
    }
}

/// A request to run an action under a throttle.
#[derive(Debug, Clone)]
pub struct ThrottleRequest {
    scope: String,
    key: String,
    policy: Policy,
    force: bool,
}

impl ThrottleRequest {
    /// Create a request for `(scope, key)` limited by `policy`.
    pub fn new(scope: impl Into<String>, key: impl Into<String>, policy: Policy) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
            policy,
            force: false,
        }
    }

    /// Skip the policy check while still recording the occurrence.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Shorthand for `with_force(true)`.
    pub fn forced(self) -> Self {
        self.with_force(true)
    }

    /// The scope.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Whether the policy check is skipped.
    pub fn is_forced(&self) -> bool {
        self.force
    }

    /// Validate the request and return its throttle identity.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for a malformed scope or key, or for an
    /// empty policy on a non-forced request.
    pub fn validate(&self) -> Result<ThrottleKey, ConfigurationError> {
        let key = ThrottleKey::new(self.scope.as_str(), self.key.as_str())?;
        if self.policy.is_empty() && !self.force {
            return Err(ConfigurationError::EmptyPolicy);
        }
        Ok(key)
    }
}

/// Coordinates throttling decisions against a shared store.
///
/// The engine keeps no per-key state; every decision is evaluated against the
/// store. Clones share the store, clock and metrics.
pub struct ThrottleEngine<S>
where
    S: Store,
{
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl<S> ThrottleEngine<S>
where
    S: Store,
{
    /// Create an engine over `store` using the system clock.
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    /// Create an engine over a store shared with other components.
    pub fn from_shared(store: Arc<S>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock::new()),
            metrics: Metrics::new(),
        }
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the metrics tracker, e.g. to share one across engines.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run `action` if `request` is admitted.
    ///
    /// The action receives the open transaction; anything it writes through
    /// it commits or rolls back together with the throttle bookkeeping. The
    /// action must not start a separate transaction of its own.
    ///
    /// # Errors
    /// Returns `ThrottleError::Configuration` before touching the store if the
    /// request is invalid, and `ThrottleError::Store` if the store fails. In
    /// both cases nothing is written.
    pub async fn decide<F, T, E>(
        &self,
        request: &ThrottleRequest,
        action: F,
    ) -> Result<Outcome<T, E>, ThrottleError>
    where
        F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        let key = request.validate()?;
        let mut tx = self.store.begin().await?;

        let now = match self.check(&mut tx, &key, request).await {
            Ok(Some(now)) => now,
            Ok(None) => {
                self.discard(tx, &key).await;
                self.metrics.record_throttled();
                return Ok(Outcome::Throttled);
            }
            Err(e) => {
                self.discard(tx, &key).await;
                return Err(e.into());
            }
        };

        let value = match action(&mut tx).await {
            Ok(value) => value,
            Err(cause) => {
                self.discard(tx, &key).await;
                self.metrics.record_failed();
                tracing::debug!(throttle = %key, "throttled action failed, rolled back");
                return Ok(Outcome::Failed(cause));
            }
        };

        if let Err(e) = record(&mut tx, &key, now).await {
            self.discard(tx, &key).await;
            return Err(e.into());
        }
        tx.commit().await?;

        self.metrics.record_admitted(request.force);
        tracing::trace!(throttle = %key, forced = request.force, "occurrence admitted");
        Ok(Outcome::Admitted(value))
    }

    /// Record an occurrence if `request` is admitted, without running anything.
    ///
    /// # Errors
    /// Same as [`decide`](Self::decide).
    pub async fn admit(
        &self,
        request: &ThrottleRequest,
    ) -> Result<Outcome<(), Infallible>, ThrottleError> {
        self.decide(request, |_tx| Box::pin(async { Ok(()) })).await
    }

    /// Read the state row for `(scope, key)` without locking it.
    ///
    /// # Errors
    /// Returns `ThrottleError::Configuration` for a malformed identity and
    /// `ThrottleError::Store` if the read fails.
    pub async fn state(
        &self,
        scope: &str,
        key: &str,
    ) -> Result<Option<ThrottleState>, ThrottleError> {
        let key = ThrottleKey::new(scope, key)?;
        Ok(self.store.load_state(&key).await?)
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get a reference to the clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Get a reference to the metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Lock the state row and evaluate the policy.
    ///
    /// Returns the decision instant if admitted, `None` if throttled.
    async fn check(
        &self,
        tx: &mut S::Tx,
        key: &ThrottleKey,
        request: &ThrottleRequest,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        if tx.insert_state_if_absent(key, self.clock.now()).await? {
            tracing::trace!(throttle = %key, "created throttle state");
        }
        tx.lock_state(key).await?;

        // Read the clock only once the lock is held, so occurrence times
        // follow lock order.
        let now = self.clock.now();
        if request.force {
            return Ok(Some(now));
        }

        let history = match request.policy.earliest_cutoff(now) {
            Some(cutoff) => tx.event_times_after(key, cutoff).await?,
            None => Vec::new(),
        };

        match request.policy.evaluate(now, &history) {
            PolicyDecision::Allow => Ok(Some(now)),
            PolicyDecision::Deny { window, observed } => {
                tracing::debug!(
                    throttle = %key,
                    window = %window,
                    observed,
                    "occurrence throttled"
                );
                Ok(None)
            }
        }
    }

    /// Roll back, logging instead of returning a rollback failure.
    async fn discard(&self, tx: S::Tx, key: &ThrottleKey) {
        if let Err(e) = tx.rollback().await {
            tracing::warn!(
                error = %e,
                throttle = %key,
                "Failed to roll back throttle transaction"
            );
        }
    }
}

async fn record<T>(tx: &mut T, key: &ThrottleKey, now: DateTime<Utc>) -> Result<(), StoreError>
where
    T: Transaction,
{
    tx.insert_event(key, now).await?;
    tx.touch_state(key, now).await
}

impl<S> Clone for ThrottleEngine<S>
where
    S: Store,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            metrics: self.metrics.clone(),
        }
    }
}

impl<S> fmt::Debug for ThrottleEngine<S>
where
    S: Store,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleEngine")
            .field("store", &self.store)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::WindowUnit;
    use crate::infrastructure::memory_store::MemoryStore;
    use crate::infrastructure::mocks::MockClock;
    use chrono::Duration;

    fn engine_at(start: DateTime<Utc>) -> (ThrottleEngine<MemoryStore>, MockClock) {
        let clock = MockClock::new(start);
        let engine = ThrottleEngine::new(MemoryStore::new()).with_clock(Arc::new(clock.clone()));
        (engine, clock)
    }

    #[test]
    fn test_request_validation() {
        let empty = ThrottleRequest::new("s", "k", Policy::empty());
        assert_eq!(empty.validate(), Err(ConfigurationError::EmptyPolicy));
        assert!(empty.clone().forced().validate().is_ok());

        let bad = ThrottleRequest::new("", "k", Policy::per(WindowUnit::Hour, 1));
        assert_eq!(
            bad.validate(),
            Err(ConfigurationError::Identity(IdentityError::EmptyScope))
        );
    }

    #[tokio::test]
    async fn test_decide_returns_action_value() {
        let (engine, _clock) = engine_at(Utc::now());
        let request = ThrottleRequest::new("user:1", "welcome", Policy::per(WindowUnit::Hour, 1));

        let outcome = engine
            .decide(&request, |_tx| Box::pin(async { Ok::<_, String>("sent") }))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Admitted("sent"));
    }

    #[tokio::test]
    async fn test_window_reopens_after_period() {
        let (engine, clock) = engine_at(Utc::now());
        let request = ThrottleRequest::new("user:1", "digest", Policy::per(WindowUnit::Minute, 1));

        assert!(engine.admit(&request).await.unwrap().is_admitted());
        assert!(engine.admit(&request).await.unwrap().is_throttled());

        clock.advance(Duration::minutes(1));
        assert!(engine.admit(&request).await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn test_empty_policy_rejected_before_store_access() {
        let (engine, _clock) = engine_at(Utc::now());
        let request = ThrottleRequest::new("s", "k", Policy::empty());

        let result = engine.admit(&request).await;
        assert!(matches!(
            result,
            Err(ThrottleError::Configuration(ConfigurationError::EmptyPolicy))
        ));
        assert_eq!(engine.state("s", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_metrics_follow_outcomes() {
        let (engine, _clock) = engine_at(Utc::now());
        let request = ThrottleRequest::new("s", "k", Policy::per(WindowUnit::Hour, 1));

        engine.admit(&request).await.unwrap();
        engine.admit(&request).await.unwrap();
        engine.admit(&request.clone().forced()).await.unwrap();
        engine
            .decide(&request.clone().forced(), |_tx| {
                Box::pin(async { Err::<(), _>("boom") })
            })
            .await
            .unwrap();

        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.decisions_admitted, 2);
        assert_eq!(snapshot.decisions_forced, 1);
        assert_eq!(snapshot.decisions_throttled, 1);
        assert_eq!(snapshot.decisions_failed, 1);
    }

    #[tokio::test]
    async fn test_state_tracks_last_occurrence() {
        let start = Utc::now();
        let (engine, clock) = engine_at(start);
        let request = ThrottleRequest::new("s", "k", Policy::per(WindowUnit::Day, 5));

        engine.admit(&request).await.unwrap();
        clock.advance(Duration::seconds(30));
        engine.admit(&request).await.unwrap();

        let state = engine.state("s", "k").await.unwrap().unwrap();
        assert_eq!(state.created_at, start);
        assert_eq!(state.last_occurred_at, Some(start + Duration::seconds(30)));
    }
}
