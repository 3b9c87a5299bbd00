//! Lightweight metrics helpers.

use std::time::Duration;

pub fn rate_per_sec(count: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(count as f64 / secs)
    } else {
        None
    }
}

/// True when `current` crossed a multiple of `every` since `previous`.
pub fn crossed_interval(previous: u64, current: u64, every: u64) -> bool {
    if every == 0 {
        return false;
    }
    current / every > previous / every
}
