//! Time scalar shared by tags, windows, and the dispatch ladder.
//!
//! Tags and window boundaries are plain `f64` seconds so tag arithmetic stays
//! branch-free; the janitor uses `std::time::Instant` separately for its
//! monotonic mark points.

use std::time::{SystemTime, UNIX_EPOCH};

/// Real-valued time in seconds.
pub type Time = f64;

/// Sentinel for "unset" times.
pub const TIME_ZERO: Time = 0.0;

/// Sentinel for "no upper bound".
pub const TIME_MAX: Time = f64::MAX;

/// Current wall-clock time in seconds since the UNIX epoch.
pub fn get_time() -> Time {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(TIME_ZERO)
}

/// Minimum of `current` and `possible`, treating `TIME_ZERO` as unset.
pub(crate) fn min_not_zero(current: Time, possible: Time) -> Time {
    if possible == TIME_ZERO {
        current
    } else {
        current.min(possible)
    }
}
