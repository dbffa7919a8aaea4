//! # Adaptive Scheduler
//!
//! Pure interval computation shared by the weather refresh path and the display
//! refresh path. The interval grows with consecutive failures and shrinking
//! battery, then is hard-clamped to a battery-dependent range:
//!
//! | battery | multiplier | min    | max     |
//! |---------|------------|--------|---------|
//! | < 10%   | x8         | 3600 s | 28800 s |
//! | < 20%   | x4         | 3600 s | 28800 s |
//! | < 30%   | x2         | 900 s  | 28800 s |
//! | < 50%   | x1.5       | 900 s  | 14400 s |
//! | >= 50%  | x1         | 900 s  | 14400 s |
//!
//! Failures multiply by 4 above three and by 2 for two or three.

use log::debug;
use serde::{Deserialize, Serialize};

/// Failure count saturates here.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Shortest interval allowed at this battery level, in seconds.
pub fn min_interval(battery_percent: u8) -> u32 {
    if battery_percent < 20 {
        3600
    } else {
        900
    }
}

/// Longest interval allowed at this battery level, in seconds.
pub fn max_interval(battery_percent: u8) -> u32 {
    if battery_percent < 30 {
        28800
    } else {
        14400
    }
}

/// Next allowed interval in seconds.
pub fn adaptive_interval(base_secs: u32, consecutive_failures: u32, battery_percent: u8) -> u32 {
    let mut interval = base_secs as u64;

    if consecutive_failures > 3 {
        interval *= 4;
    } else if consecutive_failures > 1 {
        interval *= 2;
    }

    interval = match battery_percent {
        0..=9 => interval * 8,
        10..=19 => interval * 4,
        20..=29 => interval * 2,
        30..=49 => interval * 3 / 2,
        _ => interval,
    };

    let min = min_interval(battery_percent);
    let max = max_interval(battery_percent);
    let result = interval.clamp(min as u64, max as u64) as u32;

    debug!(
        "Adaptive interval: battery {}%, failures {}, base {}s -> {}s",
        battery_percent, consecutive_failures, base_secs, result
    );
    result
}

/// True once at least `interval_secs` have passed since `last_attempt`.
pub fn is_due(last_attempt: i64, now: i64, interval_secs: u32) -> bool {
    now.saturating_sub(last_attempt) >= interval_secs as i64
}

/// Refreshing is allowed only strictly above the low-battery threshold.
pub fn should_refresh(battery_percent: u8, low_battery_threshold: u8) -> bool {
    battery_percent > low_battery_threshold
}

/// Refresh bookkeeping that survives deep sleep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleState {
    pub consecutive_failures: u32,
    /// Unix seconds of the last attempt; 0 when never attempted
    pub last_attempt: i64,
}

impl ScheduleState {
    pub fn record_success(&mut self, now: i64) {
        self.consecutive_failures = 0;
        self.last_attempt = now;
    }

    pub fn record_failure(&mut self, now: i64) {
        self.consecutive_failures = (self.consecutive_failures + 1).min(MAX_CONSECUTIVE_FAILURES);
        self.last_attempt = now;
    }

    /// Interval for the current failure count.
    pub fn interval(&self, base_secs: u32, battery_percent: u8) -> u32 {
        adaptive_interval(base_secs, self.consecutive_failures, battery_percent)
    }

    /// Whether a refresh should be attempted at `now`.
    ///
    /// Never due at or below `low_battery_threshold`; otherwise due when never
    /// attempted or when the adaptive interval has elapsed.
    pub fn is_due(
        &self,
        now: i64,
        base_secs: u32,
        battery_percent: u8,
        low_battery_threshold: u8,
    ) -> bool {
        if !should_refresh(battery_percent, low_battery_threshold) {
            return false;
        }
        self.last_attempt == 0
            || is_due(self.last_attempt, now, self.interval(base_secs, battery_percent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_very_low_battery_clamps_to_eight_hours() {
        assert_eq!(adaptive_interval(3600, 0, 5), 28800);
    }

    #[test]
    fn test_healthy_battery_keeps_base() {
        assert_eq!(adaptive_interval(3600, 0, 80), 3600);
    }

    #[test]
    fn test_interval_always_within_battery_bounds() {
        for battery in 0..=100u8 {
            for failures in 0..=MAX_CONSECUTIVE_FAILURES + 2 {
                for base in [0, 60, 900, 3600, 7200, 86_400, u32::MAX] {
                    let i = adaptive_interval(base, failures, battery);
                    assert!(
                        (min_interval(battery)..=max_interval(battery)).contains(&i),
                        "battery {battery} failures {failures} base {base} -> {i}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_failure_multiplier_steps() {
        // 50% battery: no battery multiplier, bounds 900..=14400
        assert_eq!(adaptive_interval(1800, 1, 50), 1800);
        assert_eq!(adaptive_interval(1800, 2, 50), 3600);
        assert_eq!(adaptive_interval(1800, 3, 50), 3600);
        assert_eq!(adaptive_interval(1800, 4, 50), 7200);
    }

    #[test]
    fn test_medium_battery_scales_by_half() {
        assert_eq!(adaptive_interval(3600, 0, 40), 5400);
    }

    #[test]
    fn test_small_base_is_raised_to_minimum() {
        assert_eq!(adaptive_interval(60, 0, 90), 900);
    }

    #[test]
    fn test_due_check_is_inclusive() {
        assert!(is_due(1000, 4600, 3600));
        assert!(!is_due(1000, 4599, 3600));
    }

    #[test]
    fn test_refresh_requires_battery_strictly_above_threshold() {
        assert!(!should_refresh(15, 15));
        assert!(should_refresh(16, 15));

        let state = ScheduleState::default();
        assert!(!state.is_due(1_000_000, 3600, 15, 15));
        assert!(state.is_due(1_000_000, 3600, 16, 15));
    }

    #[test]
    fn test_failures_are_capped_and_reset() {
        let mut state = ScheduleState::default();
        for t in 0..10 {
            state.record_failure(t);
        }
        assert_eq!(state.consecutive_failures, MAX_CONSECUTIVE_FAILURES);
        assert_eq!(state.last_attempt, 9);

        state.record_success(100);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_attempt, 100);
    }
}
