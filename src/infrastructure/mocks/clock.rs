//! Mock clock for testing.

use crate::application::ports::Clock;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Mock clock for testing.
///
/// Allows tests to control time progression explicitly, enabling deterministic
/// testing of window boundaries.
///
/// # Examples
///
/// ```
/// use durable_throttle::infrastructure::mocks::MockClock;
/// use durable_throttle::application::ports::Clock;
/// use chrono::{Duration, Utc};
///
/// let start = Utc::now();
/// let clock = MockClock::new(start);
///
/// // Time starts at the specified instant
/// assert_eq!(clock.now(), start);
///
/// // Advance time explicitly
/// clock.advance(Duration::minutes(10));
/// assert_eq!(clock.now(), start + Duration::minutes(10));
///
/// // Or set to a specific instant
/// let new_time = start + Duration::hours(3);
/// clock.set(new_time);
/// assert_eq!(clock.now(), new_time);
/// ```
///
/// # Thread Safety
///
/// `MockClock` is thread-safe and can be cloned to share across threads.
/// All clones share the same underlying time value, so advancing time in
/// one clone affects all clones.
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a mock clock starting at a specific instant.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        let mut time = self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock");
        *time += duration;
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut time = self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock");
        *time = instant;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .expect("MockClock mutex poisoned - a test thread panicked while holding the lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock() {
        let start = Utc::now();
        let clock = MockClock::new(start);

        assert_eq!(clock.now(), start);

        clock.advance(Duration::seconds(10));
        assert_eq!(clock.now(), start + Duration::seconds(10));

        let new_time = start - Duration::days(1);
        clock.set(new_time);
        assert_eq!(clock.now(), new_time);
    }

    #[test]
    fn test_clones_share_time() {
        let start = Utc::now();
        let clock = MockClock::new(start);
        let clone = clock.clone();

        std::thread::spawn(move || clone.advance(Duration::seconds(5)))
            .join()
            .unwrap();

        assert_eq!(clock.now(), start + Duration::seconds(5));
    }
}
