//! Admission policies for throttled actions.
//!
//! A policy is a set of independent windows, each allowing at most
//! `max_count` occurrences within a rolling period. An occurrence is admitted
//! only when every window still has capacity.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Period covered by a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowUnit {
    /// One second
    Second,
    /// One minute
    Minute,
    /// One hour
    Hour,
    /// One day (24 hours)
    Day,
    /// One week (7 days)
    Week,
}

impl WindowUnit {
    /// Length of the rolling period for this unit.
    pub fn duration(self) -> Duration {
        match self {
            WindowUnit::Second => Duration::seconds(1),
            WindowUnit::Minute => Duration::minutes(1),
            WindowUnit::Hour => Duration::hours(1),
            WindowUnit::Day => Duration::days(1),
            WindowUnit::Week => Duration::weeks(1),
        }
    }

    /// Lowercase name used in configuration and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            WindowUnit::Second => "second",
            WindowUnit::Minute => "minute",
            WindowUnit::Hour => "hour",
            WindowUnit::Day => "day",
            WindowUnit::Week => "week",
        }
    }
}

impl fmt::Display for WindowUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single `(unit, max_count)` admission constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    unit: WindowUnit,
    max_count: u32,
}

impl Window {
    /// Create a window allowing `max_count` occurrences per `unit`.
    pub fn new(unit: WindowUnit, max_count: u32) -> Self {
        Self { unit, max_count }
    }

    /// The window's unit.
    pub fn unit(&self) -> WindowUnit {
        self.unit
    }

    /// Maximum occurrences admitted within one period.
    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// Events strictly after this instant fall inside the window.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.unit.duration()
    }

    /// Count the timestamps inside the window ending at `now`.
    pub fn count_within(&self, now: DateTime<Utc>, history: &[DateTime<Utc>]) -> usize {
        let cutoff = self.cutoff(now);
        history.iter().filter(|&&at| at > cutoff).count()
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_count, self.unit)
    }
}

/// Decision made by evaluating a policy against event history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Every window has capacity left
    Allow,
    /// At least one window is full
    Deny {
        /// The first full window, in unit order
        window: Window,
        /// Events counted inside that window
        observed: usize,
    },
}

impl PolicyDecision {
    /// Check if this decision is Allow.
    pub fn is_allow(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }

    /// Check if this decision is Deny.
    pub fn is_deny(&self) -> bool {
        matches!(self, PolicyDecision::Deny { .. })
    }
}

/// Errors returned when building a policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// The same unit was given two different limits
    #[error("conflicting limits for unit `{unit}`: {first} and {second}")]
    ConflictingUnit {
        /// Unit listed twice
        unit: WindowUnit,
        /// Limit seen first
        first: u32,
        /// Limit seen second
        second: u32,
    },
}

/// Multi-window admission policy.
///
/// Windows are keyed by unit, so a policy holds at most one limit per unit.
/// Each window is checked on its own; the most restrictive one decides.
///
/// # Example
/// ```
/// use durable_throttle::{Policy, WindowUnit};
/// use chrono::{Duration, Utc};
///
/// let policy = Policy::builder()
///     .per(WindowUnit::Hour, 1)
///     .per(WindowUnit::Day, 3)
///     .build()
///     .unwrap();
///
/// let now = Utc::now();
/// let history = [now - Duration::hours(2), now - Duration::minutes(30)];
///
/// // The day window has room, the hour window does not.
/// assert!(policy.evaluate(now, &history).is_deny());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Policy {
    windows: BTreeMap<WindowUnit, u32>,
}

impl Policy {
    /// Create a policy from a list of windows.
    ///
    /// # Errors
    /// Returns `PolicyError::ConflictingUnit` if a unit is repeated with a
    /// different limit.
    pub fn new(windows: impl IntoIterator<Item = Window>) -> Result<Self, PolicyError> {
        let mut map = BTreeMap::new();
        for window in windows {
            if let Some(first) = map.insert(window.unit, window.max_count) {
                if first != window.max_count {
                    return Err(PolicyError::ConflictingUnit {
                        unit: window.unit,
                        first,
                        second: window.max_count,
                    });
                }
            }
        }
        Ok(Self { windows: map })
    }

    /// A policy without windows; only usable for forced requests.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start building a policy.
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    /// Shorthand for a single-window policy.
    pub fn per(unit: WindowUnit, max_count: u32) -> Self {
        Self {
            windows: BTreeMap::from([(unit, max_count)]),
        }
    }

    /// Check whether the policy has no windows.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Iterate over the windows, shortest unit first.
    pub fn windows(&self) -> impl Iterator<Item = Window> + '_ {
        self.windows
            .iter()
            .map(|(&unit, &max_count)| Window::new(unit, max_count))
    }

    /// Longest period covered by any window.
    pub fn longest_period(&self) -> Option<Duration> {
        self.windows.keys().next_back().map(|unit| unit.duration())
    }

    /// Oldest cutoff across all windows.
    ///
    /// Only events strictly after this instant can affect an evaluation at
    /// `now`, so a single range read bounded by it serves every window.
    pub fn earliest_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.longest_period().map(|period| now - period)
    }

    /// Decide whether one more occurrence at `now` fits every window.
    ///
    /// `history` holds prior occurrence timestamps in any order; entries
    /// outside a window are ignored for that window.
    pub fn evaluate(&self, now: DateTime<Utc>, history: &[DateTime<Utc>]) -> PolicyDecision {
        for window in self.windows() {
            let observed = window.count_within(now, history);
            if observed >= window.max_count as usize {
                return PolicyDecision::Deny { window, observed };
            }
        }
        PolicyDecision::Allow
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for window in self.windows() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}", window)?;
            first = false;
        }
        Ok(())
    }
}

/// Builder for [`Policy`].
#[derive(Debug, Default)]
pub struct PolicyBuilder {
    windows: Vec<Window>,
}

impl PolicyBuilder {
    /// Allow `max_count` occurrences per `unit`.
    pub fn per(mut self, unit: WindowUnit, max_count: u32) -> Self {
        self.windows.push(Window::new(unit, max_count));
        self
    }

    /// Build the policy.
    ///
    /// # Errors
    /// Returns `PolicyError::ConflictingUnit` if a unit was given two limits.
    pub fn build(self) -> Result<Policy, PolicyError> {
        Policy::new(self.windows)
    }
}
