//! Deadline clock: microsecond timestamps and deadline arithmetic.
//!
//! Deadlines are absolute microsecond timestamps taken from the same clock
//! used for the expiry comparison, so only relative consistency matters.
//! "Infinity" is a distinct variant rather than a sentinel value.

use std::time::Duration;

use chrono::Utc;

/// Absolute timestamp in microseconds since the Unix epoch.
pub type Micros = i64;

/// Current timestamp in microseconds.
pub fn now_micros() -> Micros {
    Utc::now().timestamp_micros()
}

/// Absolute deadline for a synchronous work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Expires once the clock passes this timestamp.
    At(Micros),
    /// Never expires.
    Infinity,
}

impl Deadline {
    /// Deadline `timeout` from `now`; `None` means no deadline.
    pub fn from_timeout(now: Micros, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(t) => Deadline::At(now.saturating_add(t.as_micros() as Micros)),
            None => Deadline::Infinity,
        }
    }

    /// Whether the deadline has passed at `now`.
    ///
    /// The comparison is strict: a deadline equal to `now` is already expired.
    pub fn is_expired(&self, now: Micros) -> bool {
        match self {
            Deadline::At(t) => *t <= now,
            Deadline::Infinity => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_equal_to_now_is_expired() {
        let d = Deadline::At(1_000);
        assert!(d.is_expired(1_000));
    }

    #[test]
    fn deadline_in_future_is_live() {
        let d = Deadline::At(1_001);
        assert!(!d.is_expired(1_000));
        assert!(d.is_expired(1_001));
        assert!(d.is_expired(2_000));
    }

    #[test]
    fn infinity_never_expires() {
        assert!(!Deadline::Infinity.is_expired(Micros::MAX));
    }

    #[test]
    fn from_timeout_adds_to_now() {
        let d = Deadline::from_timeout(500, Some(Duration::from_micros(250)));
        assert_eq!(d, Deadline::At(750));
    }

    #[test]
    fn from_none_is_infinity() {
        assert_eq!(Deadline::from_timeout(500, None), Deadline::Infinity);
    }

    #[test]
    fn now_micros_is_monotonic_enough() {
        let a = now_micros();
        let b = now_micros();
        assert!(b >= a);
    }
}
