// ABOUTME: Clock synchronization with the server
// ABOUTME: Median-filtered offset and smoothed round-trip latency estimates

mod clock;

pub use clock::LocalClock;

use crate::protocol::Timeval;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Number of offset samples kept for the median filter
const OFFSET_WINDOW: usize = 200;

/// Number of values around the median that are averaged
const MEDIAN_MEAN: usize = 3;

/// Weight of a new sample in the round-trip average
const RTT_ALPHA: f64 = 0.1;

/// Rounds performed right after connecting
pub const QUICK_SYNC_ROUNDS: u32 = 50;

/// Spacing of the rounds in the initial burst
pub const QUICK_SYNC_INTERVAL: Duration = Duration::from_micros(100);

/// Spacing of rounds once the burst is done
pub const SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Response timeout for a single time request
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct SyncState {
    offsets: VecDeque<i64>,
    diff_to_server: i64,
    round_trip: Option<f64>,
}

/// Estimate of the offset between the local clock and the server clock
///
/// Shared between the event loop (which records round trips) and the audio
/// thread (which converts server timestamps into local deadlines).
#[derive(Debug)]
pub struct TimeSync {
    clock: LocalClock,
    state: Mutex<SyncState>,
}

impl TimeSync {
    /// Create an unsynchronized estimator with a fresh local clock
    pub fn new() -> Self {
        Self::with_clock(LocalClock::new())
    }

    /// Create an estimator on an existing clock
    pub fn with_clock(clock: LocalClock) -> Self {
        Self {
            clock,
            state: Mutex::new(SyncState::default()),
        }
    }

    /// Local clock used for all timestamps of this session
    pub fn clock(&self) -> &LocalClock {
        &self.clock
    }

    /// Record one completed time round trip
    ///
    /// `sent` is the server's transmit time of the response, `received` the
    /// local arrival time, `server_latency` the client-to-server latency the
    /// server measured for the request.
    pub fn record_round_trip(&self, sent: Timeval, received: Timeval, server_latency: Timeval) {
        let c2s = server_latency.to_micros();
        let s2c = received.to_micros() - sent.to_micros();
        self.record_sample((c2s - s2c) / 2, c2s + s2c);
    }

    fn record_sample(&self, offset_us: i64, round_trip_us: i64) {
        let mut state = self.state.lock();

        if state.offsets.len() == OFFSET_WINDOW {
            state.offsets.pop_front();
        }
        state.offsets.push_back(offset_us);
        state.diff_to_server = median_mean(&state.offsets, MEDIAN_MEAN);

        let rtt = round_trip_us.max(0) as f64;
        state.round_trip = Some(match state.round_trip {
            Some(avg) => avg + RTT_ALPHA * (rtt - avg),
            None => rtt,
        });
    }

    /// Current offset (server minus local) in microseconds
    pub fn diff_to_server(&self) -> i64 {
        self.state.lock().diff_to_server
    }

    /// Smoothed round-trip latency
    pub fn round_trip(&self) -> Duration {
        let rtt = self.state.lock().round_trip.unwrap_or(0.0);
        Duration::from_micros(rtt as u64)
    }

    /// Number of samples in the filter window
    pub fn samples(&self) -> usize {
        self.state.lock().offsets.len()
    }

    /// Local time in microseconds
    #[inline]
    pub fn now_micros(&self) -> i64 {
        self.clock.now_micros()
    }

    /// Local time in wire format
    #[inline]
    pub fn now(&self) -> Timeval {
        self.clock.now()
    }

    /// Best estimate of the server clock right now, in microseconds
    pub fn server_now_micros(&self) -> i64 {
        self.clock.now_micros() + self.diff_to_server()
    }

    /// Forget all samples (the next server may run a different clock)
    pub fn reset(&self) {
        *self.state.lock() = SyncState::default();
    }
}

impl Default for TimeSync {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean of the `mean` values around the median of `values`
fn median_mean(values: &VecDeque<i64>, mean: usize) -> i64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted: Vec<i64> = values.iter().copied().collect();
    sorted.sort_unstable();

    let mid = sorted.len() / 2;
    if sorted.len() < mean {
        return sorted[mid];
    }
    let low = mid.saturating_sub(mean / 2);
    let high = (low + mean).min(sorted.len());
    let window = &sorted[low..high];
    window.iter().sum::<i64>() / window.len() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic jitter in [0, max) without pulling in a RNG crate
    fn jitter(seed: &mut u64, max: i64) -> i64 {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((*seed >> 33) as i64).rem_euclid(max)
    }

    /// Simulate one round trip against a server whose clock is `offset` ahead
    fn round_trip(sync: &TimeSync, t: i64, offset: i64, up: i64, down: i64) {
        let server_received = t + up + offset;
        let server_sent = server_received + 20;
        let client_received = server_sent - offset + down;
        sync.record_round_trip(
            Timeval::from_micros(server_sent),
            Timeval::from_micros(client_received),
            Timeval::from_micros(server_received - t),
        );
    }

    #[test]
    fn test_symmetric_round_trip_is_exact() {
        let sync = TimeSync::new();
        round_trip(&sync, 1_000_000, 5_000, 300, 300);
        // c2s = 300 + 5000, s2c = 300 - 5000; server processing time cancels out
        assert_eq!(sync.diff_to_server(), 5_000);
        assert_eq!(sync.samples(), 1);
    }

    #[test]
    fn test_converges_after_quick_sync_burst() {
        let sync = TimeSync::new();
        let true_offset = 123_456_789;
        let mut seed = 42;

        for round in 0..QUICK_SYNC_ROUNDS as i64 {
            let up = 200 + jitter(&mut seed, 800);
            let down = 200 + jitter(&mut seed, 800);
            round_trip(&sync, round * 1_000, true_offset, up, down);
        }

        let error = (sync.diff_to_server() - true_offset).abs();
        // Each sample is off by (up - down) / 2, at most 400us
        assert!(error <= 400, "offset error too large: {}us", error);
        assert_eq!(sync.samples(), QUICK_SYNC_ROUNDS as usize);
        assert!(sync.round_trip() >= Duration::from_micros(350));
    }

    #[test]
    fn test_outlier_does_not_move_estimate() {
        let sync = TimeSync::new();
        for round in 0..20 {
            round_trip(&sync, round * 1_000, 10_000, 250, 250);
        }
        let before = sync.diff_to_server();

        // One round trip with a huge queueing delay on the way up
        round_trip(&sync, 50_000, 10_000, 80_000, 250);
        assert_eq!(sync.diff_to_server(), before);
    }

    #[test]
    fn test_window_is_bounded() {
        let sync = TimeSync::new();
        for round in 0..(OFFSET_WINDOW as i64 + 50) {
            round_trip(&sync, round, 0, 100, 100);
        }
        assert_eq!(sync.samples(), OFFSET_WINDOW);
    }

    #[test]
    fn test_reset_forgets_samples() {
        let sync = TimeSync::new();
        round_trip(&sync, 0, 1_000_000, 100, 100);
        assert_ne!(sync.diff_to_server(), 0);

        sync.reset();
        assert_eq!(sync.diff_to_server(), 0);
        assert_eq!(sync.samples(), 0);
        assert_eq!(sync.round_trip(), Duration::ZERO);
    }

    #[test]
    fn test_server_now_applies_offset() {
        let sync = TimeSync::new();
        round_trip(&sync, 0, 2_000_000, 100, 100);
        let diff = sync.server_now_micros() - sync.now_micros();
        assert!((diff - sync.diff_to_server()).abs() < 1_000);
    }

    #[test]
    fn test_median_mean() {
        let values: VecDeque<i64> = [5, 1, 100, 3, 4].into_iter().collect();
        // sorted: 1 3 4 5 100, middle three: 3 4 5
        assert_eq!(median_mean(&values, 3), 4);

        let single: VecDeque<i64> = [7].into_iter().collect();
        assert_eq!(median_mean(&single, 3), 7);
    }
}
