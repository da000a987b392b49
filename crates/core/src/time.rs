//! Wall-clock helpers.
//!
//! Components take explicit `now` parameters wherever timing matters so
//! tests stay deterministic; this module is the single place that reads
//! the system clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds in one second.
pub const MS_PER_SEC: u64 = 1_000;

/// Convert whole seconds to milliseconds.
pub fn secs_to_ms(secs: u64) -> u64 {
    secs.saturating_mul(MS_PER_SEC)
}

/// Convert whole hours to milliseconds.
pub fn hours_to_ms(hours: u64) -> u64 {
    hours.saturating_mul(3_600).saturating_mul(MS_PER_SEC)
}
