use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// Odd, so the counter walks every 64-bit state before repeating.
const STEP: u64 = 0xA076_1D64_78BD_642F;

/// Lock-free jitter source for retry randomization.
///
/// Draws step a shared atomic counter and run the raw value through an
/// integer avalanche, so neighboring draws decorrelate without any locking.
/// The quality bar is only "spread retry instants apart"; one instance
/// serves the whole process and failing entries never allocate generator
/// state of their own.
#[derive(Debug)]
pub(crate) struct JitterRng {
  counter: AtomicU64,
}

impl JitterRng {
  pub fn new(seed: u64) -> Self {
    JitterRng {
      counter: AtomicU64::new(seed),
    }
  }

  /// Returns a uniform sample from `[0, 1)`.
  pub fn next_f64(&self) -> f64 {
    // Relaxed suffices: the counter only has to hand out distinct values,
    // it orders nothing else.
    let raw = self.counter.fetch_add(STEP, Ordering::Relaxed);
    let top53 = Self::mix(raw) >> 11;
    top53 as f64 * (1.0 / (1u64 << 53) as f64)
  }

  // splitmix-style finalizer; shifts and multipliers from the murmur3
  // lineage of avalanche constants.
  fn mix(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
  }
}

/// Process-wide jitter source shared by all caches.
pub(crate) static JITTER: Lazy<JitterRng> = Lazy::new(|| {
  let seed = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos() as u64)
    .unwrap_or(0x5EED);
  JitterRng::new(seed)
});
