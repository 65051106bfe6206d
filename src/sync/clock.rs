// ABOUTME: Local monotonic clock
// ABOUTME: Provides the client-side timestamps used for time sync and pacing

use crate::protocol::Timeval;
use std::time::Instant;

/// Local clock for generating timestamps
///
/// The client uses a monotonic clock starting from when the clock was created.
/// All timestamps are in microseconds from this start point; the server never
/// interprets them beyond computing latencies, so the epoch is arbitrary.
#[derive(Debug, Clone, Copy)]
pub struct LocalClock {
    /// When the clock started
    start: Instant,
}

impl LocalClock {
    /// Create a new clock starting now
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get current local time in microseconds
    #[inline]
    pub fn now_micros(&self) -> i64 {
        self.start.elapsed().as_micros() as i64
    }

    /// Get current local time in wire format
    #[inline]
    pub fn now(&self) -> Timeval {
        Timeval::from_micros(self.now_micros())
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_clock_monotonic() {
        let clock = LocalClock::new();
        let t1 = clock.now_micros();
        sleep(Duration::from_millis(10));
        let t2 = clock.now_micros();

        assert!(t2 > t1, "Clock should be monotonically increasing");
        assert!(t2 - t1 >= 10_000, "At least 10ms should have passed");
    }

    #[test]
    fn test_clock_copies_share_epoch() {
        let clock = LocalClock::new();
        let copy = clock;
        sleep(Duration::from_millis(2));
        let a = clock.now_micros();
        let b = copy.now_micros();
        assert!((a - b).abs() < 1_000);
    }
}
