//! Time sources used for entry timestamps and housekeeping

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::millis;

/// A millisecond time source.
///
/// The pool stamps entries and drives housekeeping with whatever clock it is
/// given, so anomaly detection can be exercised by swapping in a
/// [`ManualClock`].
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds since an arbitrary, fixed origin.
    fn now_millis(&self) -> u64;

    fn elapsed_since(&self, earlier: u64) -> Duration {
        Duration::from_millis(self.now_millis().saturating_sub(earlier))
    }
}

/// Monotonic clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

// Starting far from zero keeps `now - window` style arithmetic away from the
// floor when entries are stamped right after start.
const MONOTONIC_BASE_MILLIS: u64 = 1 << 32;

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        MONOTONIC_BASE_MILLIS.saturating_add(millis(self.origin.elapsed()))
    }
}

/// A clock that only moves when told to.
///
/// # Examples
///
/// ```
/// use esox_connpool::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new(10_000);
/// clock.advance(Duration::from_secs(1));
/// assert_eq!(clock.now_millis(), 11_000);
///
/// clock.rewind(Duration::from_millis(500));
/// assert_eq!(clock.now_millis(), 10_500);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(millis(by), Ordering::SeqCst);
    }

    /// Move the clock backwards, saturating at zero.
    pub fn rewind(&self, by: Duration) {
        let by = millis(by);
        let _ = self
            .millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_sub(by))
            });
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Signed difference between two readings, rendered for log lines, e.g. `-1s200ms`.
pub fn elapsed_display(start: u64, end: u64) -> String {
    let (sign, delta) = if end >= start {
        ("", end - start)
    } else {
        ("-", start - end)
    };

    let mut out = String::from(sign);
    let days = delta / 86_400_000;
    let hours = delta / 3_600_000 % 24;
    let minutes = delta / 60_000 % 60;
    let seconds = delta / 1_000 % 60;
    let millis = delta % 1_000;

    for (value, unit) in [(days, "d"), (hours, "h"), (minutes, "m"), (seconds, "s")] {
        if value > 0 {
            out.push_str(&format!("{value}{unit}"));
        }
    }
    if millis > 0 || delta == 0 {
        out.push_str(&format!("{millis}ms"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let a = clock.now_millis();
        let b = clock.now_millis();
        assert!(b >= a);
        assert!(a >= MONOTONIC_BASE_MILLIS);
    }

    #[test]
    fn manual_clock_rewind_saturates() {
        let clock = ManualClock::new(100);
        clock.rewind(Duration::from_secs(1));
        assert_eq!(clock.now_millis(), 0);
    }

    #[test]
    fn elapsed_since_saturates_on_retrograde_reading() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.elapsed_since(2_000), Duration::ZERO);
        assert_eq!(clock.elapsed_since(400), Duration::from_millis(600));
    }

    #[test]
    fn elapsed_display_formats_units() {
        assert_eq!(elapsed_display(0, 0), "0ms");
        assert_eq!(elapsed_display(0, 1_200), "1s200ms");
        assert_eq!(elapsed_display(1_200, 0), "-1s200ms");
        assert_eq!(elapsed_display(0, 61_000), "1m1s");
        assert_eq!(elapsed_display(0, 90_000_000), "1d1h");
    }
}
