//! Observability metrics for throttling decisions.
//!
//! Counters are per engine instance. They describe what this process decided,
//! not the global state of the shared store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking throttling statistics.
///
/// All metrics use atomic operations for thread-safe updates and reads.
/// Clones share the same counters.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    /// Decisions whose action ran and was committed
    decisions_admitted: AtomicU64,
    /// Decisions denied by the policy
    decisions_throttled: AtomicU64,
    /// Decisions whose action returned an error
    decisions_failed: AtomicU64,
    /// Admitted decisions that bypassed the policy
    decisions_forced: AtomicU64,
    /// Events deleted by retention
    events_purged: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                decisions_admitted: AtomicU64::new(0),
                decisions_throttled: AtomicU64::new(0),
                decisions_failed: AtomicU64::new(0),
                decisions_forced: AtomicU64::new(0),
                events_purged: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn record_admitted(&self, forced: bool) {
        self.inner.decisions_admitted.fetch_add(1, Ordering::Relaxed);
        if forced {
            self.inner.decisions_forced.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_throttled(&self) {
        self.inner
            .decisions_throttled
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.inner.decisions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_purged(&self, count: u64) {
        self.inner.events_purged.fetch_add(count, Ordering::Relaxed);
    }

    /// Get the total number of admitted decisions, forced ones included.
    pub fn decisions_admitted(&self) -> u64 {
        self.inner.decisions_admitted.load(Ordering::Relaxed)
    }

    /// Get the total number of throttled decisions.
    pub fn decisions_throttled(&self) -> u64 {
        self.inner.decisions_throttled.load(Ordering::Relaxed)
    }

    /// Get the total number of decisions whose action failed.
    pub fn decisions_failed(&self) -> u64 {
        self.inner.decisions_failed.load(Ordering::Relaxed)
    }

    /// Get the number of admitted decisions that were forced.
    pub fn decisions_forced(&self) -> u64 {
        self.inner.decisions_forced.load(Ordering::Relaxed)
    }

    /// Get the total number of purged events.
    pub fn events_purged(&self) -> u64 {
        self.inner.events_purged.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            decisions_admitted: self.decisions_admitted(),
            decisions_throttled: self.decisions_throttled(),
            decisions_failed: self.decisions_failed(),
            decisions_forced: self.decisions_forced(),
            events_purged: self.events_purged(),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        self.inner.decisions_admitted.store(0, Ordering::Relaxed);
        self.inner.decisions_throttled.store(0, Ordering::Relaxed);
        self.inner.decisions_failed.store(0, Ordering::Relaxed);
        self.inner.decisions_forced.store(0, Ordering::Relaxed);
        self.inner.events_purged.store(0, Ordering::Relaxed);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Decisions whose action ran and was committed
    pub decisions_admitted: u64,
    /// Decisions denied by the policy
    pub decisions_throttled: u64,
    /// Decisions whose action returned an error
    pub decisions_failed: u64,
    /// Admitted decisions that bypassed the policy
    pub decisions_forced: u64,
    /// Events deleted by retention
    pub events_purged: u64,
}

impl MetricsSnapshot {
    /// Fraction of evaluated decisions that were throttled (0.0 to 1.0).
    ///
    /// Returns 0.0 if no decisions have been made.
    pub fn throttle_rate(&self) -> f64 {
        let total = self.total_decisions();
        if total == 0 {
            0.0
        } else {
            self.decisions_throttled as f64 / total as f64
        }
    }

    /// Total decisions that reached an outcome.
    pub fn total_decisions(&self) -> u64 {
        self.decisions_admitted
            .saturating_add(self.decisions_throttled)
            .saturating_add(self.decisions_failed)
    }
}
