//! Core time types for the Wirelink client
//!
//! Message timestamps, rate windows and error events are all expressed as
//! milliseconds since the Unix epoch. Components obtain "now" through a
//! [`TimeSource`] so tests can drive time by hand.

use core::fmt;
use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp (zero if `other` is later)
    pub fn duration_since(&self, other: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }

    /// Shift this timestamp back by a duration
    pub fn saturating_sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Trait for providing timestamps
///
/// Implementations should be cheap to call; middleware consults the time
/// source for every message it processes.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Time source shared between the client and its middleware units
pub type SharedTimeSource = Arc<dyn TimeSource>;

/// Wall-clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }

    /// Boxed instance for use as a [`SharedTimeSource`]
    pub fn shared() -> SharedTimeSource {
        Arc::new(Self)
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ----------------------------------------------------------------------------
// Manual Time Source
// ----------------------------------------------------------------------------

#[cfg(any(test, feature = "testing"))]
mod manual {
    use super::{TimeSource, Timestamp};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Hand-driven time source for deterministic tests
    #[derive(Debug, Clone, Default)]
    pub struct ManualTimeSource {
        current_time: Arc<AtomicU64>,
    }

    impl ManualTimeSource {
        /// Create a manual time source starting at a specific time
        pub fn new_at(start_time: u64) -> Self {
            Self {
                current_time: Arc::new(AtomicU64::new(start_time)),
            }
        }

        /// Advance time by the specified number of milliseconds
        pub fn advance(&self, millis: u64) {
            self.current_time.fetch_add(millis, Ordering::SeqCst);
        }

        /// Set the time to a specific value
        pub fn set_time(&self, millis: u64) {
            self.current_time.store(millis, Ordering::SeqCst);
        }
    }

    impl TimeSource for ManualTimeSource {
        fn now(&self) -> Timestamp {
            Timestamp::new(self.current_time.load(Ordering::SeqCst))
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub use manual::ManualTimeSource;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic() {
        let earlier = Timestamp::new(1_000);
        let later = earlier + 250;

        assert_eq!(later.as_millis(), 1_250);
        assert_eq!(later - earlier, 250);
        assert_eq!(earlier - later, 0);
        assert_eq!(later.duration_since(earlier), Duration::from_millis(250));
    }

    #[test]
    fn test_timestamp_serializes_as_number() {
        let json = serde_json::to_string(&Timestamp::new(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::new_at(100);
        assert_eq!(clock.now().as_millis(), 100);

        clock.advance(50);
        assert_eq!(clock.now().as_millis(), 150);

        clock.set_time(10);
        assert_eq!(clock.now().as_millis(), 10);
    }
}
