//! Time budget helpers shared by the tracker and the lifecycle policy.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// True when more than `limit` has elapsed since `started`.
pub fn exceeded(started: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    elapsed(started, now) > limit
}

/// Elapsed time between two instants, clamped at zero when the clock went backwards.
pub fn elapsed(started: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - started).to_std().unwrap_or(Duration::ZERO)
}

/// Fraction of `limit` used since `started`.
pub fn elapsed_ratio(started: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> f64 {
    if limit.is_zero() {
        return 0.0;
    }
    elapsed(started, now).as_secs_f64() / limit.as_secs_f64()
}
