use crate::completion::{AggregateStyle, CompletionFuture, CompletionSink};
use crate::entry::EntrySnapshot;
use crate::error::{BoxError, CacheError, LoaderError, ProcessingError};
use crate::metrics::MetricsSnapshot;
use crate::processor::{EntryProcessor, ProcessingResult};
use crate::record::LoadRecord;
use crate::dispatch::DispatchHint;
use crate::shared::{CacheShared, ReadOp, Resolved};

use ahash::{HashMap, HashSet, HashSetExt};
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

/// A thread-safe loading cache.
///
/// Reads that miss run the configured loader; all concurrent callers for the
/// same key share one in-flight load and observe the same completion.
pub struct Cache<K, V, H = ahash::RandomState> {
  pub(crate) shared: Arc<CacheShared<K, V, H>>,
}

impl<K, V, H> fmt::Debug for Cache<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Cache").field("shared", &self.shared).finish()
  }
}

enum PendingRead<K, V> {
  Ready(Result<Option<Arc<V>>, CacheError>),
  Wait(Arc<LoadRecord<K, V>>),
}

impl<K, V, H> Cache<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  pub(crate) fn from_shared(shared: Arc<CacheShared<K, V, H>>) -> Self {
    Cache { shared }
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.shared.metrics.snapshot()
  }

  /// Returns the value for a key, loading it on a miss.
  ///
  /// Blocks until the entry is settled. `Ok(None)` is returned for a cached
  /// null (with `permit_null_values`) or when no loader is configured and
  /// the key is absent. A cached, non-suppressed load failure surfaces as
  /// [`CacheError::Loader`].
  pub fn get(&self, key: &K) -> Result<Option<Arc<V>>, CacheError> {
    self.shared.get_value(key)
  }

  /// Returns the values for a set of keys, loading the missing ones.
  ///
  /// Duplicate keys are deduplicated. Keys whose load failed are omitted
  /// from the result (their cached failure stays observable through
  /// [`peek_entry`](Cache::peek_entry)); when *every* requested key failed
  /// the aggregated failure is returned instead.
  pub fn get_all<I>(&self, keys: I) -> Result<HashMap<K, Arc<V>>, CacheError>
  where
    I: IntoIterator<Item = K>,
  {
    if self.shared.is_closed() {
      return Err(CacheError::Closed);
    }
    let keys = dedup_keys(keys);
    if keys.is_empty() {
      return Ok(HashMap::default());
    }
    let mut pending: Vec<(K, PendingRead<K, V>)> = Vec::with_capacity(keys.len());
    let mut starts = Vec::new();
    let mut refreshes = Vec::new();
    for key in keys {
      match self.shared.resolve(&key, ReadOp::Get)? {
        Resolved::Value { value, refresh } => {
          if let Some(start) = refresh {
            refreshes.push(start);
          }
          pending.push((key, PendingRead::Ready(Ok(value))));
        }
        Resolved::Failed(error) => {
          pending.push((key, PendingRead::Ready(Err(error.into()))));
        }
        Resolved::Share(record) => pending.push((key, PendingRead::Wait(record))),
        Resolved::Start(start) => {
          pending.push((key, PendingRead::Wait(start.record.clone())));
          starts.push(start);
        }
      }
    }
    self.shared.dispatch_loads(refreshes, DispatchHint::Refresh);
    self.shared.dispatch_loads(starts, DispatchHint::Blocking);

    let total = pending.len();
    let mut found = HashMap::default();
    let mut failures = Vec::new();
    for (key, read) in pending {
      let outcome = match read {
        PendingRead::Ready(outcome) => outcome,
        PendingRead::Wait(record) => record.wait_blocking(),
      };
      match outcome {
        Ok(Some(value)) => {
          found.insert(key, value);
        }
        Ok(None) => {}
        Err(CacheError::Closed) => return Err(CacheError::Closed),
        Err(error) => failures.push(error),
      }
    }
    if !failures.is_empty() && failures.len() == total {
      let errors: Vec<LoaderError> = failures
        .into_iter()
        .filter_map(|e| match e {
          CacheError::Loader(le) => Some(le),
          _ => None,
        })
        .collect();
      return Err(CacheError::Loader(LoaderError::aggregate(errors, None)));
    }
    Ok(found)
  }

  /// Starts loading every key that has no settled value yet and returns a
  /// handle resolving when all requested keys completed.
  ///
  /// Never blocks. Keys already loading are attached to the in-flight load
  /// rather than loaded twice; keys with a fresh value complete right away.
  /// Failures are captured and aggregated into the handle's result.
  pub fn load_all<I>(&self, keys: I) -> CompletionFuture
  where
    I: IntoIterator<Item = K>,
  {
    if self.shared.is_closed() {
      return CompletionFuture::done(Err(CacheError::Closed));
    }
    let keys = dedup_keys(keys);
    if keys.is_empty() {
      return CompletionFuture::done(Ok(()));
    }
    let sink = CompletionSink::new(keys.len(), AggregateStyle::CountOnly);
    let mut starts = Vec::new();
    let mut refreshes = Vec::new();
    for key in keys {
      match self.shared.resolve(&key, ReadOp::LoadAll) {
        Err(error) => sink.key_done(Some(error)),
        Ok(Resolved::Value { refresh, .. }) => {
          if let Some(start) = refresh {
            refreshes.push(start);
          }
          sink.key_done(None);
        }
        Ok(Resolved::Failed(error)) => sink.key_done(Some(error.into())),
        Ok(Resolved::Share(record)) => subscribe(&sink, &record),
        Ok(Resolved::Start(start)) => {
          subscribe(&sink, &start.record);
          starts.push(start);
        }
      }
    }
    let future = sink.future();
    self.shared.dispatch_loads(refreshes, DispatchHint::Refresh);
    self.shared.dispatch_loads(starts, DispatchHint::Background);
    future
  }

  /// Forces one load per requested key, regardless of current entry state,
  /// and returns a handle resolving when all of them completed.
  ///
  /// Unlike [`load_all`](Cache::load_all) this never coalesces with loads
  /// already in flight: n concurrent `reload_all` calls for a key cause n
  /// loader invocations.
  pub fn reload_all<I>(&self, keys: I) -> CompletionFuture
  where
    I: IntoIterator<Item = K>,
  {
    if self.shared.is_closed() {
      return CompletionFuture::done(Err(CacheError::Closed));
    }
    let keys = dedup_keys(keys);
    if keys.is_empty() {
      return CompletionFuture::done(Ok(()));
    }
    let sink = CompletionSink::new(keys.len(), AggregateStyle::CountOfTotal);
    let mut starts = Vec::new();
    for key in keys {
      match self.shared.force_start(&key) {
        Err(error) => sink.key_done(Some(error)),
        Ok(start) => {
          subscribe(&sink, &start.record);
          starts.push(start);
        }
      }
    }
    let future = sink.future();
    self.shared.dispatch_loads(starts, DispatchHint::Background);
    future
  }

  /// Runs a processor function against each of the given entries. Reading a
  /// missing value from the processor drives the regular loading pipeline.
  /// Per-key results and failures are collected into the returned map.
  pub fn invoke_all<I, F, R>(
    &self,
    keys: I,
    processor: F,
  ) -> Result<HashMap<K, ProcessingResult<R>>, CacheError>
  where
    I: IntoIterator<Item = K>,
    F: Fn(&mut EntryProcessor<'_, K, V, H>) -> Result<R, BoxError>,
  {
    if self.shared.is_closed() {
      return Err(CacheError::Closed);
    }
    let keys = dedup_keys(keys);
    let mut results = HashMap::default();
    for key in keys {
      let mut entry = EntryProcessor::new(&self.shared, key.clone());
      let result = processor(&mut entry)
        .map_err(|error| ProcessingError::new(Arc::from(error)));
      results.insert(key, result);
    }
    Ok(results)
  }

  /// Returns the current value without ever triggering a load. A cached,
  /// non-suppressed load failure surfaces as [`CacheError::Loader`].
  pub fn peek(&self, key: &K) -> Result<Option<Arc<V>>, CacheError> {
    self.shared.peek_value(key)
  }

  /// Snapshot view of the entry, including a cached exception; never loads.
  pub fn peek_entry(&self, key: &K) -> Option<EntrySnapshot<K, V>> {
    self.shared.peek_entry_snapshot(key)
  }

  /// Inserts a value, overriding any state. Waiters of an in-flight load
  /// for the key observe the put value; the load's own result is discarded
  /// when it arrives.
  pub fn put(&self, key: K, value: V) -> Result<(), CacheError> {
    self.shared.put_value(key, value)
  }

  /// Removes the entry for a key, returning whether one was present.
  pub fn remove(&self, key: &K) -> bool {
    self.shared.remove_entry(key)
  }

  /// True for settled entries, including cached failures; false while the
  /// first load of a key is in flight.
  pub fn contains_key(&self, key: &K) -> bool {
    self.shared.contains(key)
  }

  /// Closes the cache. Idempotent. In-flight waiters complete with
  /// [`CacheError::Closed`]; loader callbacks arriving afterwards are
  /// absorbed silently.
  pub fn close(&self) {
    self.shared.close();
  }

  pub fn is_closed(&self) -> bool {
    self.shared.is_closed()
  }
}

fn subscribe<K, V>(sink: &Arc<CompletionSink>, record: &Arc<LoadRecord<K, V>>)
where
  K: Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  let sink = sink.clone();
  record.on_complete(Box::new(move |outcome| {
    sink.key_done(outcome.as_ref().err().cloned());
  }));
}

fn dedup_keys<K, I>(keys: I) -> Vec<K>
where
  K: Eq + Hash + Clone,
  I: IntoIterator<Item = K>,
{
  let mut seen = HashSet::new();
  let mut out = Vec::new();
  for key in keys {
    if seen.insert(key.clone()) {
      out.push(key);
    }
  }
  out
}
