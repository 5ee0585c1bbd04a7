use crate::error::SharedError;
use crate::record::LoadRecord;
use crate::time;

use parking_lot::Mutex;
use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

/// A per-key slot in the cache. The state machine inside is linearized by the
/// slot mutex; cross-slot operations never hold two slot locks at once.
pub(crate) struct Slot<K, V> {
  pub(crate) key: K,
  pub(crate) state: Mutex<SlotState<K, V>>,
}

/// Lifecycle of a slot. The "empty" state is implicit: a key without a slot
/// in the map is empty, and a slot is created directly in `Loading`.
pub(crate) enum SlotState<K, V> {
  /// A load is in flight and no previous value is being served.
  Loading(Arc<LoadRecord<K, V>>),
  /// A settled value (possibly a cached null).
  Present(PresentState<V>),
  /// A settled value still being served while a background reload runs.
  Refreshing {
    current: PresentState<V>,
    record: Arc<LoadRecord<K, V>>,
  },
  /// A cached load failure, optionally still serving a suppressed stale
  /// value until `suppress_until`.
  Exceptional(ExceptionalState<V>),
  /// Tombstone: the slot was taken out of the map. Holders of a stale
  /// `Arc<Slot>` observe this and retry the lookup.
  Removed,
}

/// Value payload of a present entry. `value` is `None` for a cached null.
pub(crate) struct PresentState<V> {
  pub(crate) value: Option<Arc<V>>,
  pub(crate) loaded_at: u64,
  /// Expiry timestamp in epoch nanoseconds. 0 means eternal.
  pub(crate) expires_at: u64,
}

impl<V> Clone for PresentState<V> {
  fn clone(&self) -> Self {
    PresentState {
      value: self.value.clone(),
      loaded_at: self.loaded_at,
      expires_at: self.expires_at,
    }
  }
}

impl<V> PresentState<V> {
  #[inline]
  pub(crate) fn is_expired(&self, now: u64) -> bool {
    self.expires_at != 0 && now >= self.expires_at
  }

  /// Remaining time to live at `now`, in nanoseconds. `u64::MAX` if eternal.
  #[inline]
  pub(crate) fn remaining_ttl(&self, now: u64) -> u64 {
    if self.expires_at == 0 {
      u64::MAX
    } else {
      self.expires_at.saturating_sub(now)
    }
  }
}

pub(crate) struct ExceptionalState<V> {
  pub(crate) info: Arc<ExceptionInfo>,
  /// Previous value retained for suppression. Present only while the entry
  /// is allowed to keep serving it.
  pub(crate) stale: Option<PresentState<V>>,
  pub(crate) suppress_until: u64,
  pub(crate) retry_at: u64,
}

/// Information about a cached load failure, handed to the resilience policy
/// and exposed through entry snapshots.
#[derive(Debug, Clone)]
pub struct ExceptionInfo {
  pub(crate) error: SharedError,
  pub(crate) since: u64,
  pub(crate) load_time: u64,
  pub(crate) retry_count: u32,
}

impl ExceptionInfo {
  /// The original error raised by the loader.
  pub fn error(&self) -> &(dyn Error + Send + Sync + 'static) {
    &*self.error
  }

  /// When the current failure streak began.
  pub fn since(&self) -> Instant {
    time::nanos_to_instant(self.since)
  }

  /// When the failing load completed.
  pub fn load_time(&self) -> Instant {
    time::nanos_to_instant(self.load_time)
  }

  /// First failure of a streak counts as 0; resets on success.
  pub fn retry_count(&self) -> u32 {
    self.retry_count
  }

  /// Raw epoch-relative timestamps for policy arithmetic. Only differences
  /// between values from the same process are meaningful.
  pub fn since_nanos(&self) -> u64 {
    self.since
  }

  pub fn load_time_nanos(&self) -> u64 {
    self.load_time
  }
}

/// Immutable view of an entry, as returned by `peek_entry` and handed to
/// advanced and async loaders as the current entry.
pub struct EntrySnapshot<K, V> {
  pub(crate) key: K,
  pub(crate) value: Option<Arc<V>>,
  pub(crate) exception: Option<SharedError>,
}

impl<K: Clone, V> Clone for EntrySnapshot<K, V> {
  fn clone(&self) -> Self {
    EntrySnapshot {
      key: self.key.clone(),
      value: self.value.clone(),
      exception: self.exception.clone(),
    }
  }
}

impl<K, V> EntrySnapshot<K, V> {
  pub fn key(&self) -> &K {
    &self.key
  }

  /// The entry value. `None` for a cached null or an exceptional entry
  /// without a suppressed value.
  pub fn value(&self) -> Option<&Arc<V>> {
    self.value.as_ref()
  }

  /// The cached load failure, if the entry is exceptional. A suppressed
  /// entry carries both the stale value and the exception.
  pub fn exception(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
    self.exception.as_deref()
  }
}
