//! Time and liveness seams.
//!
//! Every blocking wait in the wake cycle (connect polling, backoff, NTP
//! polling) goes through [`Clock`], so tests can run the retry logic without
//! real delays. Long loops call [`Watchdog::feed`] to signal liveness; no other
//! work runs during that call.

use std::thread;
use std::time::{Duration, Instant};

/// Monotonic time source plus a blocking sleep.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;
    /// Block the single control flow for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation backed by `std::time::Instant`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Liveness signal for an external watchdog.
pub trait Watchdog {
    fn feed(&mut self);
}

/// Yields the thread; the host equivalent of feeding the task watchdog.
#[derive(Default)]
pub struct ThreadYield;

impl Watchdog for ThreadYield {
    fn feed(&mut self) {
        thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_ms();
        clock.sleep(Duration::from_millis(5));
        assert!(clock.now_ms() >= a + 5);
    }
}
