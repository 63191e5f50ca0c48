//! Time sources.
//!
//! The session reads time only through [`Clock`], so tests drive timers and
//! the server clock offset by hand.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic and wall-clock time.
pub trait Clock: Send {
    /// Monotonic time, used for timers.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch.
    fn wall_millis(&self) -> u64;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

#[derive(Debug)]
struct ManualState {
    origin: Instant,
    elapsed: Duration,
    wall_millis: u64,
}

/// A clock that only moves when told to.
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    /// Creates a clock whose wall time starts at `wall_millis`.
    pub fn new(wall_millis: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                wall_millis,
            })),
        }
    }

    /// Moves both monotonic and wall time forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.elapsed += by;
        state.wall_millis += u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.state.lock();
        state.origin + state.elapsed
    }

    fn wall_millis(&self) -> u64 {
        self.state.lock().wall_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_shared_time() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        let start = clock.now();

        other.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
        assert_eq!(clock.wall_millis(), 1_250);
    }

    #[test]
    fn system_clock_is_past_2020() {
        assert!(SystemClock.wall_millis() > 1_577_836_800_000);
    }
}
