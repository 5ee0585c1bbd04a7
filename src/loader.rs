use crate::bulk::{BulkCallback, BulkLoaderContext};
use crate::entry::{EntrySnapshot, Slot};
use crate::error::{BoxError, CacheError, CallbackError, SharedError};
use crate::handles::Cache;
use crate::record::LoadRecord;
use crate::runtime::Executor;
use crate::shared::CacheShared;
use crate::time;

use ahash::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub(crate) type SyncLoaderFn<K, V> =
  Arc<dyn Fn(&K) -> Result<Option<V>, BoxError> + Send + Sync>;

pub(crate) type AdvancedLoaderFn<K, V> = Arc<
  dyn Fn(&K, Instant, Option<&EntrySnapshot<K, V>>) -> Result<Option<V>, BoxError>
    + Send
    + Sync,
>;

pub(crate) type AsyncLoaderFn<K, V, H> = Arc<
  dyn Fn(&K, &LoaderContext<K, V, H>, LoadCallback<K, V, H>) -> Result<(), BoxError>
    + Send
    + Sync,
>;

pub(crate) type BulkLoaderFn<K, V> =
  Arc<dyn Fn(&[K]) -> Result<HashMap<K, V>, BoxError> + Send + Sync>;

pub(crate) type AsyncBulkLoaderFn<K, V, H> = Arc<
  dyn Fn(&[K], &BulkLoaderContext<K, V, H>, BulkCallback<K, V, H>) -> Result<(), BoxError>
    + Send
    + Sync,
>;

/// The configured loader, one of five shapes. The dispatcher adapts all of
/// them to a single per-key completion protocol internally.
pub(crate) enum Loader<K, V, H> {
  Sync(SyncLoaderFn<K, V>),
  Advanced(AdvancedLoaderFn<K, V>),
  Async(AsyncLoaderFn<K, V, H>),
  Bulk(BulkLoaderFn<K, V>),
  AsyncBulk(AsyncBulkLoaderFn<K, V, H>),
}

impl<K, V, H> Clone for Loader<K, V, H> {
  fn clone(&self) -> Self {
    match self {
      Loader::Sync(f) => Loader::Sync(f.clone()),
      Loader::Advanced(f) => Loader::Advanced(f.clone()),
      Loader::Async(f) => Loader::Async(f.clone()),
      Loader::Bulk(f) => Loader::Bulk(f.clone()),
      Loader::AsyncBulk(f) => Loader::AsyncBulk(f.clone()),
    }
  }
}

/// Per-load view handed to an async loader.
pub struct LoaderContext<K, V, H = ahash::RandomState> {
  pub(crate) shared: Arc<CacheShared<K, V, H>>,
  pub(crate) record: Arc<LoadRecord<K, V>>,
}

impl<K, V, H> Clone for LoaderContext<K, V, H> {
  fn clone(&self) -> Self {
    LoaderContext {
      shared: self.shared.clone(),
      record: self.record.clone(),
    }
  }
}

impl<K, V, H> LoaderContext<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// When this load started.
  pub fn start_time(&self) -> Instant {
    time::nanos_to_instant(self.record.started_at)
  }

  /// Snapshot of the entry as it was when the load started: `None` for an
  /// absent key, or one that expired without keep-data.
  ///
  /// Only valid while the load is in flight. Once the load completed this
  /// fails deterministically with
  /// [`CacheError::ContextAccessOutsideLoad`].
  pub fn current_entry(&self) -> Result<Option<EntrySnapshot<K, V>>, CacheError>
  where
    K: Clone,
  {
    if self.record.is_done() {
      return Err(CacheError::ContextAccessOutsideLoad);
    }
    Ok(self.record.snapshot.clone())
  }

  /// General-purpose executor for caller-supplied work.
  pub fn executor(&self) -> Arc<dyn Executor> {
    self.shared.common_executor.clone()
  }

  /// The executor configured for loader offloading.
  pub fn loader_executor(&self) -> Arc<dyn Executor> {
    self.shared.loader_executor.clone()
  }

  /// A cache handle for re-entrant operations.
  pub fn cache(&self) -> Cache<K, V, H> {
    Cache::from_shared(self.shared.clone())
  }
}

/// Completion callback handed to an async loader. Cloneable so the loader
/// can move it across threads; completing it a second time fails with
/// [`CallbackError::AlreadyCompleted`] without touching cache state.
pub struct LoadCallback<K, V, H = ahash::RandomState> {
  pub(crate) shared: Arc<CacheShared<K, V, H>>,
  pub(crate) slot: Arc<Slot<K, V>>,
  pub(crate) record: Arc<LoadRecord<K, V>>,
  pub(crate) used: Arc<AtomicBool>,
}

impl<K, V, H> Clone for LoadCallback<K, V, H> {
  fn clone(&self) -> Self {
    LoadCallback {
      shared: self.shared.clone(),
      slot: self.slot.clone(),
      record: self.record.clone(),
      used: self.used.clone(),
    }
  }
}

impl<K, V, H> LoadCallback<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Completes the load with a value; `None` is a null result.
  pub fn on_load_success(&self, value: Option<V>) -> Result<(), CallbackError> {
    if self.shared.is_closed() {
      // Callbacks arriving after close are absorbed without effect.
      return Ok(());
    }
    if self.used.swap(true, Ordering::SeqCst) {
      return Err(CallbackError::AlreadyCompleted);
    }
    self
      .shared
      .complete_load(&self.slot, &self.record, Ok(value));
    Ok(())
  }

  /// Completes the load with a failure.
  pub fn on_load_failure(&self, error: BoxError) -> Result<(), CallbackError> {
    if self.shared.is_closed() {
      return Ok(());
    }
    if self.used.swap(true, Ordering::SeqCst) {
      return Err(CallbackError::AlreadyCompleted);
    }
    let error: SharedError = Arc::from(error);
    self
      .shared
      .complete_load(&self.slot, &self.record, Err(error));
    Ok(())
  }

  /// Failure path for an async loader that returned an error before its
  /// callback fired. Loses against a racing callback completion.
  pub(crate) fn fail_from_return(&self, error: BoxError) {
    let _ = self.on_load_failure(error);
  }
}
