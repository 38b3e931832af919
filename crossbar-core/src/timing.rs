//! Monotonic millisecond clock
//!
//! Expiry deadlines are bucketed on a millisecond grid, so all deadline
//! arithmetic runs on a monotonic clock anchored at the first use. Wall-clock
//! adjustments can never expire (or immortalize) a connection.

use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the process first asked for the time.
#[inline]
pub fn now_ms() -> u64 {
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}
