//! Timeout value helpers.

use std::fmt;
use std::time::Duration;

/// Represents a timeout duration for lock operations.
///
/// - `Some(duration)` - Wait up to this duration
/// - `None` - Wait indefinitely
pub type Timeout = Option<Duration>;

/// Internal helper for timeout calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutValue {
    millis: i64, // -1 for infinite
}

impl TimeoutValue {
    pub const INFINITE: Self = Self { millis: -1 };
    pub const ZERO: Self = Self { millis: 0 };

    pub fn is_infinite(&self) -> bool {
        self.millis < 0
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    pub fn as_duration(&self) -> Option<Duration> {
        if self.is_infinite() {
            None
        } else {
            Some(Duration::from_millis(self.millis as u64))
        }
    }

    /// Milliseconds, or `None` when infinite.
    pub fn as_millis(&self) -> Option<i64> {
        (!self.is_infinite()).then_some(self.millis)
    }

    /// The duration reported by [`LockError::Timeout`](crate::LockError::Timeout).
    pub fn elapsed_budget(&self) -> Duration {
        self.as_duration().unwrap_or(Duration::MAX)
    }
}

impl From<Duration> for TimeoutValue {
    fn from(duration: Duration) -> Self {
        Self {
            millis: i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        }
    }
}

impl From<Option<Duration>> for TimeoutValue {
    fn from(timeout: Option<Duration>) -> Self {
        match timeout {
            None => Self::INFINITE,
            Some(d) => Self::from(d),
        }
    }
}

impl fmt::Display for TimeoutValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_millis() {
            None => f.write_str("infinite"),
            Some(ms) => write!(f, "{ms}ms"),
        }
    }
}
