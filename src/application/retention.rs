//! Event retention.
//!
//! Events only matter while they can fall inside some window. These
//! operations delete older history; scheduling them is left to the caller.

use crate::application::engine::{ThrottleEngine, ThrottleError};
use crate::application::ports::Store;
use crate::domain::identity::ThrottleKey;
use crate::domain::policy::Policy;
use chrono::{DateTime, Duration, Utc};

/// Extra history kept beyond the longest window.
pub const RETENTION_MARGIN: Duration = Duration::hours(24);

/// Oldest instant that can still influence an evaluation of `policy`, minus
/// [`RETENTION_MARGIN`].
///
/// Events strictly before the returned instant are safe to purge.
///
/// # Example
/// ```
/// use durable_throttle::{retention, Policy, WindowUnit};
/// use chrono::{Duration, Utc};
///
/// let policy = Policy::builder()
///     .per(WindowUnit::Hour, 2)
///     .per(WindowUnit::Day, 5)
///     .build()
///     .unwrap();
/// let now = Utc::now();
///
/// assert_eq!(retention::safe_cutoff(&policy, now), now - Duration::hours(48));
/// ```
pub fn safe_cutoff(policy: &Policy, now: DateTime<Utc>) -> DateTime<Utc> {
    let longest = policy.longest_period().unwrap_or_else(Duration::zero);
    now - longest - RETENTION_MARGIN
}

impl<S> ThrottleEngine<S>
where
    S: Store,
{
    /// Delete all events with `occurred_at < cutoff`.
    ///
    /// Never touches throttle state rows.
    ///
    /// # Returns
    /// The number of deleted events
    pub async fn purge_events_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, ThrottleError> {
        let purged = self.store().purge_events(cutoff, None).await?;
        self.metrics().record_purged(purged);
        tracing::debug!(%cutoff, purged, "purged throttle events");
        Ok(purged)
    }

    /// Delete events of one `(scope, key)` with `occurred_at < cutoff`.
    ///
    /// # Errors
    /// Returns `ThrottleError::Configuration` for a malformed identity.
    pub async fn purge_events_older_than_for(
        &self,
        scope: &str,
        key: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, ThrottleError> {
        let key = ThrottleKey::new(scope, key)?;
        let purged = self.store().purge_events(cutoff, Some(&key)).await?;
        self.metrics().record_purged(purged);
        tracing::debug!(throttle = %key, %cutoff, purged, "purged throttle events");
        Ok(purged)
    }

    /// [`safe_cutoff`] evaluated with this engine's clock.
    pub fn safe_cutoff(&self, policy: &Policy) -> DateTime<Utc> {
        safe_cutoff(policy, self.clock().now())
    }

    /// Purge every event older than [`safe_cutoff`](Self::safe_cutoff) for `policy`.
    ///
    /// Only correct when `policy` is the longest-reaching policy used with
    /// this store.
    pub async fn purge_for_policy(&self, policy: &Policy) -> Result<u64, ThrottleError> {
        self.purge_events_older_than(self.safe_cutoff(policy)).await
    }
}
