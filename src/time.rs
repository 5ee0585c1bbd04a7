use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

// Every timestamp in the crate is a nanosecond offset from one process-wide
// anchor instant, captured the first time anybody reads the clock. Offsets
// fit in a u64 and compare cheaply.
static ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Current time as nanoseconds since the anchor instant.
#[inline]
pub(crate) fn now_nanos() -> u64 {
  Instant::now().saturating_duration_since(*ANCHOR).as_nanos() as u64
}

/// Converts an anchor-relative nanosecond timestamp back into an `Instant`.
#[inline]
pub(crate) fn nanos_to_instant(nanos: u64) -> Instant {
  *ANCHOR + Duration::from_nanos(nanos)
}

/// Converts a `Duration` into nanoseconds, saturating at the representable
/// maximum so "eternal" durations stay eternal.
#[inline]
pub(crate) fn duration_to_nanos(duration: Duration) -> u64 {
  u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
