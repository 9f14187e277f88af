//! Monotonic clock and timeout helpers.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Relative timeout value meaning "never give up".
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

fn clock_base() -> Instant {
    static BASE: OnceLock<Instant> = OnceLock::new();
    *BASE.get_or_init(Instant::now)
}

/// Current time in nanoseconds from an unspecified, process-wide base.
pub fn now_nanoseconds() -> i64 {
    i64::try_from(clock_base().elapsed().as_nanos()).unwrap_or(i64::MAX)
}

/// Whether `now` lies outside the interval `[start, end)`.
///
/// The interval may wrap around the end of the `i64` range: when
/// `end < start` it covers `[start, MAX] ∪ [MIN, end)`.
pub fn has_elapsed(start: i64, end: i64, now: i64) -> bool {
    if start <= end {
        !(start <= now && now < end)
    } else {
        !(start <= now || now < end)
    }
}

/// An absolute point on the [`now_nanoseconds`] clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    At(i64),
    Never,
}

impl Deadline {
    /// Time left before the deadline, `None` for [`Deadline::Never`].
    pub fn remaining(self) -> Option<Duration> {
        match self {
            Deadline::Never => None,
            Deadline::At(end) => {
                let left = end.saturating_sub(now_nanoseconds());
                Some(Duration::from_nanos(left.max(0) as u64))
            }
        }
    }
}

/// Convert a relative timeout in nanoseconds into a deadline.
///
/// [`TIMEOUT_INFINITE`] and sums that overflow the clock both saturate to
/// [`Deadline::Never`].
pub fn absolute_timeout(relative_ns: u64) -> Deadline {
    absolute_timeout_from(now_nanoseconds(), relative_ns)
}

fn absolute_timeout_from(now: i64, relative_ns: u64) -> Deadline {
    if relative_ns == TIMEOUT_INFINITE {
        return Deadline::Never;
    }
    match i64::try_from(relative_ns)
        .ok()
        .and_then(|rel| now.checked_add(rel))
    {
        Some(end) => Deadline::At(end),
        None => Deadline::Never,
    }
}

/// How long a fence wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Relative to the start of the wait. Zero means poll.
    Relative(Duration),
    /// Absolute time on the [`now_nanoseconds`] clock.
    Absolute(i64),
    Infinite,
}

impl Timeout {
    pub const POLL: Timeout = Timeout::Relative(Duration::ZERO);

    pub fn from_nanos(ns: u64) -> Self {
        if ns == TIMEOUT_INFINITE {
            Timeout::Infinite
        } else {
            Timeout::Relative(Duration::from_nanos(ns))
        }
    }

    pub fn is_poll(&self) -> bool {
        matches!(self, Timeout::Relative(d) if d.is_zero())
    }

    /// Resolve against `start`, returning the `[start, end)` window.
    pub fn window(self, start: i64) -> (i64, Deadline) {
        let deadline = match self {
            Timeout::Infinite => Deadline::Never,
            Timeout::Absolute(end) => Deadline::At(end),
            Timeout::Relative(d) => {
                absolute_timeout_from(start, u64::try_from(d.as_nanos()).unwrap_or(u64::MAX - 1))
            }
        };
        (start, deadline)
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Timeout::Relative(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_elapsed_plain_interval() {
        assert!(!has_elapsed(100, 200, 100));
        assert!(!has_elapsed(100, 200, 199));
        assert!(has_elapsed(100, 200, 200));
        assert!(has_elapsed(100, 200, 99));
    }

    #[test]
    fn test_has_elapsed_wrapping_interval() {
        let start = i64::MAX - 10;
        let end = i64::MAX.wrapping_add(5);
        assert!(end < start);
        assert!(!has_elapsed(start, end, i64::MAX - 1));
        assert!(!has_elapsed(start, end, i64::MIN));
        assert!(has_elapsed(start, end, 10));
    }

    #[test]
    fn test_absolute_timeout_saturates() {
        assert_eq!(absolute_timeout(TIMEOUT_INFINITE), Deadline::Never);
        assert_eq!(absolute_timeout_from(i64::MAX - 5, 10), Deadline::Never);
        assert_eq!(absolute_timeout_from(0, u64::MAX - 1), Deadline::Never);
        assert_eq!(absolute_timeout_from(100, 50), Deadline::At(150));
    }

    #[test]
    fn test_clock_is_monotonic() {
        let a = now_nanoseconds();
        let b = now_nanoseconds();
        assert!(b >= a);
    }

    #[test]
    fn test_timeout_poll() {
        assert!(Timeout::POLL.is_poll());
        assert!(!Timeout::Infinite.is_poll());
        assert_eq!(Timeout::from_nanos(TIMEOUT_INFINITE), Timeout::Infinite);
    }
}
