//! Monotonic timestamps for allocation and free events.
//!
//! Timestamps are microseconds elapsed since a process-wide epoch taken the
//! first time the clock is read. They only need to be comparable with each
//! other, so a fixed epoch keeps them small enough to store in a `u64`
//! block header field.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current timestamp in microseconds since the process epoch.
#[inline]
pub fn now_micros() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

/// Microseconds elapsed since `timestamp`, saturating at zero.
#[inline]
pub fn micros_since(timestamp: u64) -> u64 {
    now_micros().saturating_sub(timestamp)
}
