use crate::error::{CacheError, ProcessingError};
use crate::shared::CacheShared;

use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

/// Per-key outcome of [`invoke_all`](crate::Cache::invoke_all): the
/// processor's return value, or the failure it raised.
pub type ProcessingResult<R> = Result<R, ProcessingError>;

/// Mutable view of one entry handed to the processor function.
///
/// Reading the value of a missing entry drives the regular loading
/// pipeline, so processors coalesce with concurrent `get`/`load_all`
/// callers the same way plain reads do.
pub struct EntryProcessor<'a, K, V, H = ahash::RandomState> {
  shared: &'a Arc<CacheShared<K, V, H>>,
  key: K,
}

impl<'a, K, V, H> EntryProcessor<'a, K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  pub(crate) fn new(shared: &'a Arc<CacheShared<K, V, H>>, key: K) -> Self {
    EntryProcessor { shared, key }
  }

  pub fn key(&self) -> &K {
    &self.key
  }

  /// The entry value, loading it when absent. Blocks like `get`.
  pub fn value(&mut self) -> Result<Option<Arc<V>>, CacheError> {
    self.shared.get_value(&self.key)
  }

  /// Whether a settled entry exists, without loading.
  pub fn exists(&self) -> bool {
    self.shared.contains(&self.key)
  }

  /// Replaces the entry value.
  pub fn set_value(&mut self, value: V) -> Result<(), CacheError> {
    self.shared.put_value(self.key.clone(), value)
  }

  /// Removes the entry.
  pub fn remove(&mut self) -> bool {
    self.shared.remove_entry(&self.key)
  }

  /// Schedules a refresh-ahead reload of a present entry. The current value
  /// keeps being served until the reload completes; a no-op when the entry
  /// is not present.
  pub fn schedule_refresh(&mut self) {
    self.shared.schedule_refresh(&self.key);
  }
}
