//! Port for reading wall-clock time.

use std::time::SystemTime;

/// Source of the current time, compared against file modification times
/// for disk expiry.
#[cfg_attr(test, mockall::automock)]
pub trait ClockPort: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> SystemTime;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockPort for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
