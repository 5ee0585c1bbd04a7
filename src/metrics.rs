use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// A thread-safe, internal metrics collector for the loading pipeline.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,
  pub(crate) loads: CachePadded<AtomicU64>,
  pub(crate) load_failures: CachePadded<AtomicU64>,
  pub(crate) suppressed_failures: CachePadded<AtomicU64>,
  pub(crate) refreshes: CachePadded<AtomicU64>,
  pub(crate) bulk_requests: CachePadded<AtomicU64>,
  pub(crate) puts: CachePadded<AtomicU64>,
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub(crate) fn count(counter: &CachePadded<AtomicU64>) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      loads: self.loads.load(Ordering::Relaxed),
      load_failures: self.load_failures.load(Ordering::Relaxed),
      suppressed_failures: self.suppressed_failures.load(Ordering::Relaxed),
      refreshes: self.refreshes.load(Ordering::Relaxed),
      bulk_requests: self.bulk_requests.load(Ordering::Relaxed),
      puts: self.puts.load(Ordering::Relaxed),
    }
  }
}

/// A point-in-time, public-facing snapshot of the cache's metrics.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// Lookups answered from a present entry.
  pub hits: u64,
  /// Lookups that had to start or join a load.
  pub misses: u64,
  /// Loader invocations started, counted per key.
  pub loads: u64,
  /// Loads that completed with an error.
  pub load_failures: u64,
  /// Failed loads whose error was suppressed in favor of a stale value.
  pub suppressed_failures: u64,
  /// Background refreshes started by refresh-ahead.
  pub refreshes: u64,
  /// Calls issued to a bulk loader.
  pub bulk_requests: u64,
  /// Direct value insertions via `put`.
  pub puts: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("loads", &self.loads)
      .field("load_failures", &self.load_failures)
      .field("suppressed_failures", &self.suppressed_failures)
      .field("refreshes", &self.refreshes)
      .field("bulk_requests", &self.bulk_requests)
      .field("puts", &self.puts)
      .finish()
  }
}
