//! Time stamps, clocks and period rounding.
//!
//! Every component that needs "now" asks an injected [`Clock`] instead of reading
//! the system time directly, so filters, the scheduler and the engine loop can be
//! driven by a [`ManualClock`] in tests.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Time stamp of a sample, marker event or scheduling deadline.
pub type Timestamp = DateTime<Utc>;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> Timestamp;
}

/// Shared clock handle passed to every component.
pub type SharedClock = Arc<dyn Clock>;

/// The host clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at `secs` seconds after the Unix epoch.
    pub fn at_secs(secs: f64) -> Self {
        Self::new(from_secs_f64(secs))
    }

    /// Jump to `when`.
    pub fn set(&self, when: Timestamp) {
        *self.now.lock() = when;
    }

    /// Move forward by `secs` seconds.
    pub fn advance(&self, secs: f64) {
        let mut now = self.now.lock();
        *now = add_secs(*now, secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

/// Seconds since the Unix epoch, with sub-second precision.
pub fn to_secs_f64(t: Timestamp) -> f64 {
    t.timestamp() as f64 + f64::from(t.timestamp_subsec_nanos()) * 1e-9
}

/// Inverse of [`to_secs_f64`].
pub fn from_secs_f64(secs: f64) -> Timestamp {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    Utc.timestamp_opt(whole as i64, nanos)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// `t + secs`, saturating on overflow.
pub fn add_secs(t: Timestamp, secs: f64) -> Timestamp {
    let delta = ChronoDuration::nanoseconds((secs * 1e9) as i64);
    t.checked_add_signed(delta).unwrap_or(t)
}

/// `a - b` in seconds.
pub fn secs_between(a: Timestamp, b: Timestamp) -> f64 {
    let delta = a.signed_duration_since(b);
    match delta.num_nanoseconds() {
        Some(nanos) => nanos as f64 * 1e-9,
        None => delta.num_milliseconds() as f64 * 1e-3,
    }
}

/// Smallest multiple of `period` seconds since the epoch that lies strictly after `t`.
///
/// A non-positive period returns `t` unchanged.
pub fn round_time_up(t: Timestamp, period: f64) -> Timestamp {
    if period <= 0.0 {
        return t;
    }
    let secs = to_secs_f64(t);
    let mut slots = (secs / period).floor() + 1.0;
    // Float division can land one slot short for stamps right on a boundary.
    if slots * period <= secs {
        slots += 1.0;
    }
    from_secs_f64(slots * period)
}

/// Convert a (possibly negative) seconds delay into a sleep duration.
pub fn delay_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_moves_to_next_boundary() {
        let t = from_secs_f64(1000.3);
        assert_eq!(to_secs_f64(round_time_up(t, 1.0)), 1001.0);
        assert_eq!(to_secs_f64(round_time_up(t, 30.0)), 1020.0);
    }

    #[test]
    fn round_up_is_strict_on_boundary() {
        let t = from_secs_f64(1020.0);
        assert_eq!(to_secs_f64(round_time_up(t, 30.0)), 1050.0);
    }

    #[test]
    fn round_up_ignores_non_positive_period() {
        let t = from_secs_f64(12.5);
        assert_eq!(round_time_up(t, 0.0), t);
        assert_eq!(round_time_up(t, -1.0), t);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::at_secs(100.0);
        clock.advance(0.25);
        assert!((to_secs_f64(clock.now()) - 100.25).abs() < 1e-6);
        assert!((secs_between(clock.now(), from_secs_f64(100.0)) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn negative_delay_is_zero() {
        assert_eq!(delay_duration(-2.0), Duration::ZERO);
        assert_eq!(delay_duration(f64::NAN), Duration::ZERO);
        assert_eq!(delay_duration(0.5), Duration::from_millis(500));
    }
}
