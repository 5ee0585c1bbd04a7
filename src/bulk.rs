use crate::entry::EntrySnapshot;
use crate::error::{BoxError, CallbackError, NullValueError, PartialResultError, SharedError};
use crate::handles::Cache;
use crate::runtime::Executor;
use crate::shared::{CacheShared, StartedLoad};
use crate::time;

use ahash::HashMap;
use parking_lot::Mutex;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::Instant;

/// One call into a bulk loader: the group of keys that transitioned to
/// loading together. Each key keeps its own load record; completions fan
/// back out per key. A key belongs to exactly one bulk request at a time.
pub(crate) struct BulkRequest<K, V, H> {
  shared: Arc<CacheShared<K, V, H>>,
  keys: Vec<K>,
  started_at: u64,
  snapshots: HashMap<K, EntrySnapshot<K, V>>,
  pending: Mutex<HashMap<K, StartedLoad<K, V>>>,
}

impl<K, V, H> BulkRequest<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  pub(crate) fn new(
    shared: Arc<CacheShared<K, V, H>>,
    loads: Vec<StartedLoad<K, V>>,
  ) -> Arc<Self> {
    let mut keys = Vec::with_capacity(loads.len());
    let mut snapshots = HashMap::default();
    let mut pending = HashMap::default();
    for load in loads {
      let key = load.slot.key.clone();
      if let Some(snapshot) = &load.record.snapshot {
        snapshots.insert(key.clone(), snapshot.clone());
      }
      keys.push(key.clone());
      pending.insert(key, load);
    }
    Arc::new(BulkRequest {
      shared,
      keys,
      started_at: time::now_nanos(),
      snapshots,
      pending: Mutex::new(pending),
    })
  }

  pub(crate) fn keys(&self) -> &[K] {
    &self.keys
  }

  /// Completes a single key of the request.
  pub(crate) fn complete_key(
    &self,
    key: &K,
    result: Result<Option<V>, SharedError>,
  ) -> Result<(), CallbackError> {
    if self.shared.is_closed() {
      return Ok(());
    }
    let load = self.pending.lock().remove(key);
    match load {
      Some(load) => {
        self.shared.complete_load(&load.slot, &load.record, result);
        Ok(())
      }
      None if self.keys.contains(key) => Err(CallbackError::AlreadyCompleted),
      None => Err(CallbackError::UnknownKey),
    }
  }

  /// Whole-bulk success. Keys present in the map complete with their value;
  /// any key of the request still pending afterwards fails with the
  /// partial-result marker.
  pub(crate) fn complete_bulk(&self, mut map: HashMap<K, V>) -> Result<(), CallbackError> {
    if self.shared.is_closed() {
      return Ok(());
    }
    let drained: Vec<(StartedLoad<K, V>, Result<Option<V>, SharedError>)> = {
      let mut pending = self.pending.lock();
      if pending.is_empty() {
        return Err(CallbackError::AlreadyCompleted);
      }
      pending
        .drain()
        .map(|(key, load)| match map.remove(&key) {
          Some(value) => (load, Ok(Some(value))),
          None => (
            load,
            Err(Arc::new(PartialResultError) as SharedError),
          ),
        })
        .collect()
    };
    for (load, result) in drained {
      self.shared.complete_load(&load.slot, &load.record, result);
    }
    Ok(())
  }

  /// Whole-bulk failure: every still-pending key observes the same error.
  pub(crate) fn fail_bulk(&self, error: SharedError) -> Result<(), CallbackError> {
    if self.shared.is_closed() {
      return Ok(());
    }
    let drained: Vec<StartedLoad<K, V>> = {
      let mut pending = self.pending.lock();
      if pending.is_empty() {
        return Err(CallbackError::AlreadyCompleted);
      }
      pending.drain().map(|(_, load)| load).collect()
    };
    for load in drained {
      self
        .shared
        .complete_load(&load.slot, &load.record, Err(error.clone()));
    }
    Ok(())
  }

  /// Failure path when the loader function itself returned an error; unlike
  /// [`fail_bulk`](Self::fail_bulk) an already-drained request is not an
  /// error here, since per-key callbacks may have completed everything.
  pub(crate) fn abort_remaining(&self, error: SharedError) {
    let _ = self.fail_bulk(error);
  }

  /// Applies the returned mapping of a sync bulk loader. A requested key
  /// missing from the map means "no value" and fails that key.
  pub(crate) fn apply_sync_result(&self, result: Result<HashMap<K, V>, BoxError>) {
    match result {
      Err(error) => self.abort_remaining(Arc::from(error)),
      Ok(mut map) => {
        if self.shared.is_closed() {
          return;
        }
        let drained: Vec<(StartedLoad<K, V>, Result<Option<V>, SharedError>)> = {
          let mut pending = self.pending.lock();
          pending
            .drain()
            .map(|(key, load)| match map.remove(&key) {
              Some(value) => (load, Ok(Some(value))),
              None => (load, Err(Arc::new(NullValueError) as SharedError)),
            })
            .collect()
        };
        for (load, result) in drained {
          self.shared.complete_load(&load.slot, &load.record, result);
        }
      }
    }
  }
}

/// Per-bulk view handed to an async bulk loader.
pub struct BulkLoaderContext<K, V, H = ahash::RandomState> {
  pub(crate) shared: Arc<CacheShared<K, V, H>>,
  pub(crate) request: Arc<BulkRequest<K, V, H>>,
}

impl<K, V, H> Clone for BulkLoaderContext<K, V, H> {
  fn clone(&self) -> Self {
    BulkLoaderContext {
      shared: self.shared.clone(),
      request: self.request.clone(),
    }
  }
}

impl<K, V, H> BulkLoaderContext<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// The deduplicated keys of this bulk call, in request order.
  pub fn keys(&self) -> &[K] {
    self.request.keys()
  }

  /// When this bulk load started.
  pub fn start_time(&self) -> Instant {
    time::nanos_to_instant(self.request.started_at)
  }

  /// Snapshots of the entries that had data when the load started, by key.
  pub fn current_entries(&self) -> &HashMap<K, EntrySnapshot<K, V>> {
    &self.request.snapshots
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

/// Completion callback handed to an async bulk loader.
///
/// Supports per-key and whole-bulk completion. Each key completes exactly
/// once: a second completion for the same key fails with
/// [`CallbackError::AlreadyCompleted`] and leaves cache state untouched.
pub struct BulkCallback<K, V, H = ahash::RandomState> {
  pub(crate) request: Arc<BulkRequest<K, V, H>>,
}

impl<K, V, H> Clone for BulkCallback<K, V, H> {
  fn clone(&self) -> Self {
    BulkCallback {
      request: self.request.clone(),
    }
  }
}

impl<K, V, H> BulkCallback<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Completes one key with a value; `None` is a null result.
  pub fn on_load_success(&self, key: &K, value: Option<V>) -> Result<(), CallbackError> {
    self.request.complete_key(key, Ok(value))
  }

  /// Completes the keys contained in the map, and fails every key of the
  /// request that is still pending afterwards with a partial-result error.
  pub fn on_bulk_success(&self, map: HashMap<K, V>) -> Result<(), CallbackError> {
    self.request.complete_bulk(map)
  }

  /// Fails one key.
  pub fn on_load_failure(&self, key: &K, error: BoxError) -> Result<(), CallbackError> {
    self.request.complete_key(key, Err(Arc::from(error)))
  }

  /// Fails every still-pending key of the request with the same error.
  pub fn on_bulk_failure(&self, error: BoxError) -> Result<(), CallbackError> {
    self.request.fail_bulk(Arc::from(error))
  }
}
