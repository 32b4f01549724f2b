//! Persistent records owned by the engine.

use crate::domain::identity::ThrottleKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per `(scope, key)`, used as the lock anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleState {
    /// Identity of the throttle
    pub key: ThrottleKey,
    /// Most recent admitted occurrence, `None` until the first admission
    pub last_occurred_at: Option<DateTime<Utc>>,
    /// When the row was created
    pub created_at: DateTime<Utc>,
    /// When the row was last modified
    pub updated_at: DateTime<Utc>,
}

impl ThrottleState {
    /// A fresh row with no admitted occurrences.
    pub fn new(key: ThrottleKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            last_occurred_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record an admitted occurrence.
    pub fn touch(&mut self, occurred_at: DateTime<Utc>) {
        self.last_occurred_at = Some(occurred_at);
        self.updated_at = occurred_at;
    }
}

/// An admitted occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Identity of the throttle
    pub key: ThrottleKey,
    /// When the occurrence was admitted
    pub occurred_at: DateTime<Utc>,
}
