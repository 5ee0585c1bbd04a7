use crate::entry::{
  EntrySnapshot, ExceptionInfo, ExceptionalState, PresentState, Slot, SlotState,
};
use crate::error::{CacheError, LoaderError, NullValueError, SharedError};
use crate::loader::Loader;
use crate::metrics::Metrics;
use crate::record::LoadRecord;
use crate::resilience::ResiliencePolicy;
use crate::runtime::{Executor, ThreadPool};
use crate::store::ShardedStore;
use crate::time;

use parking_lot::Mutex;
use std::collections::hash_map::Entry as MapEntry;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Optional per-entry expiry override. Returns the time to live computed at
/// load completion; `None` means eternal, a zero duration means "do not
/// cache this value".
pub(crate) type ExpiryFn<K, V> =
  Arc<dyn Fn(&K, Option<&V>, Instant) -> Option<Duration> + Send + Sync>;

/// A load this caller is responsible for dispatching.
pub(crate) struct StartedLoad<K, V> {
  pub(crate) slot: Arc<Slot<K, V>>,
  pub(crate) record: Arc<LoadRecord<K, V>>,
}

/// How a key resolved against its slot.
pub(crate) enum Resolved<K, V> {
  /// A value can be served right away. `refresh` carries a refresh-ahead
  /// load the caller must dispatch (without waiting on it).
  Value {
    value: Option<Arc<V>>,
    refresh: Option<StartedLoad<K, V>>,
  },
  /// A cached failure within its retry back-off window.
  Failed(LoaderError),
  /// A load is already in flight; attach to it.
  Share(Arc<LoadRecord<K, V>>),
  /// The slot transitioned to loading here; the caller dispatches.
  Start(StartedLoad<K, V>),
}

/// Distinguishes blocking reads from completion-handle operations where the
/// behavior against a refreshing entry differs: a read takes the current
/// value, a load-all attaches to the in-flight refresh.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOp {
  Get,
  LoadAll,
}

/// The internal, thread-safe core of the cache.
pub(crate) struct CacheShared<K, V, H> {
  pub(crate) store: ShardedStore<K, V, H>,
  pub(crate) metrics: Metrics,
  pub(crate) loader: Option<Loader<K, V, H>>,
  pub(crate) loader_executor: Arc<dyn Executor>,
  pub(crate) refresh_executor: Arc<dyn Executor>,
  pub(crate) common_executor: Arc<dyn Executor>,
  /// Present when the loader executor was constructed by the builder; only
  /// an owned pool is shut down on close.
  pub(crate) owned_pool: Option<Arc<ThreadPool>>,
  pub(crate) resilience: Option<Arc<dyn ResiliencePolicy>>,
  pub(crate) expire_after_write: Option<Duration>,
  pub(crate) expiry_policy: Option<ExpiryFn<K, V>>,
  pub(crate) permit_null_values: bool,
  pub(crate) keep_data_after_expired: bool,
  pub(crate) refresh_ahead: bool,
  /// Remaining-TTL threshold (nanoseconds) at or below which an access
  /// schedules a background refresh. Zero refreshes on expired access only.
  pub(crate) refresh_ahead_window: u64,
  pub(crate) closed: AtomicBool,
}

impl<K, V, H> fmt::Debug for CacheShared<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheShared")
      .field("expire_after_write", &self.expire_after_write)
      .field("refresh_ahead", &self.refresh_ahead)
      .field("permit_null_values", &self.permit_null_values)
      .field("closed", &self.closed.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}

impl<K, V, H> Drop for CacheShared<K, V, H> {
  fn drop(&mut self) {
    if let Some(pool) = self.owned_pool.take() {
      pool.shutdown();
    }
  }
}

impl<K, V, H> CacheShared<K, V, H> {
  #[inline]
  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }
}

/// Decision computed under the slot lock before acting on it; avoids holding
/// borrows into the state across the transition.
enum SlotAction<K, V> {
  Retry,
  Value(Option<Arc<V>>),
  ValueAndRefresh(Option<Arc<V>>, PresentState<V>),
  Failed(LoaderError),
  Share(Arc<LoadRecord<K, V>>),
  StartLoad {
    snapshot: Option<EntrySnapshot<K, V>>,
    prior: Option<PresentState<V>>,
    prior_exception: Option<(u64, u32)>,
  },
}

impl<K, V, H> CacheShared<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  fn snapshot_of(&self, key: &K, present: &PresentState<V>) -> EntrySnapshot<K, V> {
    EntrySnapshot {
      key: key.clone(),
      value: present.value.clone(),
      exception: None,
    }
  }

  /// Whether an accessed present entry is due for a background refresh.
  fn wants_refresh(&self, present: &PresentState<V>, now: u64) -> bool {
    self.refresh_ahead
      && self.loader.is_some()
      && present.expires_at != 0
      && present.remaining_ttl(now) <= self.refresh_ahead_window
  }

  /// Resolves a key for `get`/`get_all`/`load_all`, performing the slot
  /// state transition when a load has to start.
  pub(crate) fn resolve(
    self: &Arc<Self>,
    key: &K,
    op: ReadOp,
  ) -> Result<Resolved<K, V>, CacheError> {
    if self.is_closed() {
      return Err(CacheError::Closed);
    }
    loop {
      let shard = self.store.get_shard(key);
      let slot = match shard.map.read().get(key) {
        Some(slot) => Some(slot.clone()),
        None => None,
      };
      let slot = match slot {
        Some(slot) => slot,
        None => {
          if self.loader.is_none() {
            Metrics::count(&self.metrics.misses);
            return Ok(Resolved::Value {
              value: None,
              refresh: None,
            });
          }
          let mut guard = shard.map.write();
          match guard.entry(key.clone()) {
            MapEntry::Occupied(occupied) => occupied.get().clone(),
            MapEntry::Vacant(vacant) => {
              let record =
                LoadRecord::new(key.clone(), time::now_nanos(), false, None, None, None);
              let slot = Arc::new(Slot {
                key: key.clone(),
                state: Mutex::new(SlotState::Loading(record.clone())),
              });
              vacant.insert(slot.clone());
              Metrics::count(&self.metrics.misses);
              return Ok(Resolved::Start(StartedLoad { slot, record }));
            }
          }
        }
      };

      let mut state = slot.state.lock();
      let now = time::now_nanos();
      let action = {
        match &*state {
          SlotState::Removed => SlotAction::Retry,
          SlotState::Loading(record) => SlotAction::Share(record.clone()),
          SlotState::Refreshing { current, record } => match op {
            ReadOp::Get => SlotAction::Value(current.value.clone()),
            ReadOp::LoadAll => SlotAction::Share(record.clone()),
          },
          SlotState::Present(present) => {
            if !present.is_expired(now) {
              if self.wants_refresh(present, now) {
                SlotAction::ValueAndRefresh(present.value.clone(), present.clone())
              } else {
                SlotAction::Value(present.value.clone())
              }
            } else if self.refresh_ahead && self.loader.is_some() {
              // Expired under refresh-ahead: keep serving, reload behind.
              SlotAction::ValueAndRefresh(present.value.clone(), present.clone())
            } else if self.loader.is_none() {
              SlotAction::Value(None)
            } else if self.keep_data_after_expired {
              SlotAction::StartLoad {
                snapshot: Some(self.snapshot_of(key, present)),
                prior: Some(present.clone()),
                prior_exception: None,
              }
            } else {
              // The loader sees no current entry, but the expired value is
              // still retained as suppression material.
              SlotAction::StartLoad {
                snapshot: None,
                prior: if self.resilience.is_some() {
                  Some(present.clone())
                } else {
                  None
                },
                prior_exception: None,
              }
            }
          }
          SlotState::Exceptional(exceptional) => {
            if exceptional.stale.is_some() && now < exceptional.suppress_until {
              SlotAction::Value(
                exceptional.stale.as_ref().and_then(|s| s.value.clone()),
              )
            } else if now < exceptional.retry_at {
              SlotAction::Failed(LoaderError::from_cause(
                exceptional.info.error.clone(),
              ))
            } else if self.loader.is_none() {
              SlotAction::Failed(LoaderError::from_cause(
                exceptional.info.error.clone(),
              ))
            } else {
              let snapshot = exceptional.stale.as_ref().map(|stale| EntrySnapshot {
                key: key.clone(),
                value: stale.value.clone(),
                exception: Some(exceptional.info.error.clone()),
              });
              SlotAction::StartLoad {
                snapshot,
                prior: exceptional.stale.clone(),
                prior_exception: Some((
                  exceptional.info.since,
                  exceptional.info.retry_count,
                )),
              }
            }
          }
        }
      };

      match action {
        SlotAction::Retry => {
          drop(state);
          continue;
        }
        SlotAction::Value(value) => {
          Metrics::count(&self.metrics.hits);
          return Ok(Resolved::Value {
            value,
            refresh: None,
          });
        }
        SlotAction::ValueAndRefresh(value, current) => {
          let record = LoadRecord::new(
            key.clone(),
            now,
            false,
            Some(self.snapshot_of(key, &current)),
            Some(current.clone()),
            None,
          );
          *state = SlotState::Refreshing {
            current,
            record: record.clone(),
          };
          drop(state);
          Metrics::count(&self.metrics.hits);
          Metrics::count(&self.metrics.refreshes);
          return Ok(Resolved::Value {
            value,
            refresh: Some(StartedLoad { slot, record }),
          });
        }
        SlotAction::Failed(error) => {
          Metrics::count(&self.metrics.hits);
          return Ok(Resolved::Failed(error));
        }
        SlotAction::Share(record) => {
          Metrics::count(&self.metrics.hits);
          return Ok(Resolved::Share(record));
        }
        SlotAction::StartLoad {
          snapshot,
          prior,
          prior_exception,
        } => {
          let record = LoadRecord::new(
            key.clone(),
            now,
            false,
            snapshot,
            prior,
            prior_exception,
          );
          *state = SlotState::Loading(record.clone());
          drop(state);
          Metrics::count(&self.metrics.misses);
          return Ok(Resolved::Start(StartedLoad { slot, record }));
        }
      }
    }
  }

  /// Transitions a present slot into `Refreshing`, unless another caller
  /// got there first. Returns the load to dispatch on the refresh executor.
  fn begin_refresh(
    self: &Arc<Self>,
    slot: &Arc<Slot<K, V>>,
    expected: PresentState<V>,
  ) -> Option<StartedLoad<K, V>> {
    let record = LoadRecord::new(
      slot.key.clone(),
      time::now_nanos(),
      false,
      Some(self.snapshot_of(&slot.key, &expected)),
      Some(expected.clone()),
      None,
    );
    let mut state = slot.state.lock();
    match &*state {
      SlotState::Present(current) if current.loaded_at == expected.loaded_at => {
        let current = current.clone();
        *state = SlotState::Refreshing {
          current,
          record: record.clone(),
        };
        drop(state);
        Metrics::count(&self.metrics.refreshes);
        Some(StartedLoad {
          slot: slot.clone(),
          record,
        })
      }
      _ => None,
    }
  }

  /// Forces a load for `reload_all`, regardless of the current slot state.
  /// A slot that is already loading or refreshing gets an additional,
  /// detached load; completions apply in completion order.
  pub(crate) fn force_start(
    self: &Arc<Self>,
    key: &K,
  ) -> Result<StartedLoad<K, V>, CacheError> {
    if self.is_closed() {
      return Err(CacheError::Closed);
    }
    loop {
      let shard = self.store.get_shard(key);
      let slot = match shard.map.read().get(key) {
        Some(slot) => Some(slot.clone()),
        None => None,
      };
      let slot = match slot {
        Some(slot) => slot,
        None => {
          let mut guard = shard.map.write();
          match guard.entry(key.clone()) {
            MapEntry::Occupied(occupied) => occupied.get().clone(),
            MapEntry::Vacant(vacant) => {
              let record =
                LoadRecord::new(key.clone(), time::now_nanos(), false, None, None, None);
              let slot = Arc::new(Slot {
                key: key.clone(),
                state: Mutex::new(SlotState::Loading(record.clone())),
              });
              vacant.insert(slot.clone());
              return Ok(StartedLoad { slot, record });
            }
          }
        }
      };

      let mut state = slot.state.lock();
      let now = time::now_nanos();
      match &mut *state {
        SlotState::Removed => {
          drop(state);
          continue;
        }
        SlotState::Loading(_) => {
          // A load is already running; start another one alongside it.
          let record = LoadRecord::new(key.clone(), now, true, None, None, None);
          drop(state);
          return Ok(StartedLoad { slot, record });
        }
        SlotState::Refreshing { current, .. } => {
          let prior = current.clone();
          let snapshot = self.snapshot_of(key, &prior);
          let record =
            LoadRecord::new(key.clone(), now, true, Some(snapshot), Some(prior), None);
          drop(state);
          return Ok(StartedLoad { slot, record });
        }
        SlotState::Present(present) => {
          let current = present.clone();
          let record = LoadRecord::new(
            key.clone(),
            now,
            false,
            Some(self.snapshot_of(key, &current)),
            Some(current.clone()),
            None,
          );
          *state = SlotState::Refreshing {
            current,
            record: record.clone(),
          };
          drop(state);
          return Ok(StartedLoad { slot, record });
        }
        SlotState::Exceptional(exceptional) => {
          let snapshot = exceptional.stale.as_ref().map(|stale| EntrySnapshot {
            key: key.clone(),
            value: stale.value.clone(),
            exception: Some(exceptional.info.error.clone()),
          });
          let record = LoadRecord::new(
            key.clone(),
            now,
            false,
            snapshot,
            exceptional.stale.clone(),
            Some((exceptional.info.since, exceptional.info.retry_count)),
          );
          *state = SlotState::Loading(record.clone());
          drop(state);
          return Ok(StartedLoad { slot, record });
        }
      }
    }
  }

  /// Schedules a background refresh for a present entry, as requested by an
  /// entry processor. A no-op for any other slot state.
  pub(crate) fn schedule_refresh(self: &Arc<Self>, key: &K) {
    if self.is_closed() || self.loader.is_none() {
      return;
    }
    if let Some(slot) = self.store.slot(key) {
      let expected = {
        let state = slot.state.lock();
        match &*state {
          SlotState::Present(present) => Some(present.clone()),
          _ => None,
        }
      };
      if let Some(expected) = expected {
        if let Some(start) = self.begin_refresh(&slot, expected) {
          self.dispatch_loads(vec![start], crate::dispatch::DispatchHint::Refresh);
        }
      }
    }
  }

  /// Expiry timestamp for a newly settled value; 0 is eternal, a value at
  /// or before `load_time` means "do not cache".
  fn compute_expires_at(&self, key: &K, value: Option<&V>, load_time: u64) -> u64 {
    let ttl = match &self.expiry_policy {
      Some(policy) => policy(key, value, time::nanos_to_instant(load_time)),
      None => self.expire_after_write,
    };
    match ttl {
      None => 0,
      Some(duration) => load_time
        .saturating_add(time::duration_to_nanos(duration))
        .max(1),
    }
  }

  /// The single completion path for every load. Routes failures through the
  /// resilience policy, transitions the slot, and wakes all waiters. Never
  /// called while holding a slot lock.
  pub(crate) fn complete_load(
    self: &Arc<Self>,
    slot: &Arc<Slot<K, V>>,
    record: &Arc<LoadRecord<K, V>>,
    result: Result<Option<V>, SharedError>,
  ) {
    if self.is_closed() {
      // Close already failed the waiters; absorb the late completion.
      record.complete(Err(CacheError::Closed));
      return;
    }
    let now = time::now_nanos();

    // Normalize the success path: compute expiry and apply the null rule.
    let normalized: Result<(Option<Arc<V>>, u64, bool), SharedError> = match result {
      Ok(value) => {
        let value = value.map(Arc::new);
        let expires_at = self.compute_expires_at(&slot.key, value.as_deref(), now);
        let no_cache = expires_at != 0 && expires_at <= now;
        if value.is_none() && !self.permit_null_values && !no_cache {
          Err(Arc::new(NullValueError) as SharedError)
        } else {
          Ok((value, expires_at, no_cache))
        }
      }
      Err(error) => Err(error),
    };

    let mut remove_slot = false;
    let outcome = {
      let mut state = slot.state.lock();
      let ours = match &*state {
        SlotState::Loading(r) => Arc::ptr_eq(r, record),
        SlotState::Refreshing { record: r, .. } => Arc::ptr_eq(r, record),
        _ => false,
      };
      // Detached reload completions always apply, in completion order; a
      // record that lost its slot (put override, removal) only completes
      // its waiters.
      let apply =
        ours || (record.detached && !matches!(&*state, SlotState::Removed));

      match normalized {
        Ok((value, expires_at, no_cache)) => {
          if apply {
            if no_cache {
              *state = SlotState::Removed;
              remove_slot = true;
            } else {
              *state = SlotState::Present(PresentState {
                value: value.clone(),
                loaded_at: now,
                expires_at,
              });
            }
          }
          Ok(value)
        }
        Err(cause) => {
          Metrics::count(&self.metrics.load_failures);
          let (since, retry_count) = match record.prior_exception {
            Some((since, previous)) => (since, previous + 1),
            None => (now, 0),
          };
          let info = Arc::new(ExceptionInfo {
            error: cause.clone(),
            since,
            load_time: now,
            retry_count,
          });
          let envelope = LoaderError::from_cause(cause);
          match &self.resilience {
            None => {
              if apply {
                *state = SlotState::Removed;
                remove_slot = true;
              }
              Err(CacheError::Loader(envelope))
            }
            Some(policy) => {
              let suppress_until = policy.suppress_until(&info);
              let retry_at = policy.retry_at(&info);
              if record.prior.is_some() && suppress_until > now {
                let stale = record.prior.clone();
                let value = stale.as_ref().and_then(|s| s.value.clone());
                if apply {
                  *state = SlotState::Exceptional(ExceptionalState {
                    info,
                    stale,
                    suppress_until,
                    retry_at,
                  });
                }
                Metrics::count(&self.metrics.suppressed_failures);
                log::warn!("load failure suppressed, serving stale value");
                // Waiters observe the retained value, not the failure.
                Ok(value)
              } else if retry_at > now {
                if apply {
                  *state = SlotState::Exceptional(ExceptionalState {
                    info,
                    stale: None,
                    suppress_until: 0,
                    retry_at,
                  });
                }
                Err(CacheError::Loader(envelope))
              } else {
                if apply {
                  *state = SlotState::Removed;
                  remove_slot = true;
                }
                Err(CacheError::Loader(envelope))
              }
            }
          }
        }
      }
    };
    if remove_slot {
      self.store.remove_slot(&slot.key, slot);
    }
    record.complete(outcome);
  }

  /// Full loading read: resolve, dispatch when needed, block on completion.
  pub(crate) fn get_value(self: &Arc<Self>, key: &K) -> Result<Option<Arc<V>>, CacheError> {
    match self.resolve(key, ReadOp::Get)? {
      Resolved::Value { value, refresh } => {
        if let Some(start) = refresh {
          self.dispatch_loads(vec![start], crate::dispatch::DispatchHint::Refresh);
        }
        Ok(value)
      }
      Resolved::Failed(error) => Err(CacheError::Loader(error)),
      Resolved::Share(record) => record.wait_blocking(),
      Resolved::Start(start) => {
        let record = start.record.clone();
        self.dispatch_loads(vec![start], crate::dispatch::DispatchHint::Blocking);
        record.wait_blocking()
      }
    }
  }

  /// Inserts a value, overriding any state. During a load the slot flips to
  /// the put value and the pending waiters observe it; the loader's own
  /// completion is discarded when it arrives.
  pub(crate) fn put_value(&self, key: K, value: V) -> Result<(), CacheError> {
    if self.is_closed() {
      return Err(CacheError::Closed);
    }
    Metrics::count(&self.metrics.puts);
    let now = time::now_nanos();
    let expires_at = self.compute_expires_at(&key, Some(&value), now);
    let no_cache = expires_at != 0 && expires_at <= now;
    let value = Arc::new(value);
    loop {
      let shard = self.store.get_shard(&key);
      let slot = match shard.map.read().get(&key) {
        Some(slot) => Some(slot.clone()),
        None => None,
      };
      let slot = match slot {
        Some(slot) => slot,
        None => {
          if no_cache {
            return Ok(());
          }
          let mut guard = shard.map.write();
          match guard.entry(key.clone()) {
            MapEntry::Occupied(occupied) => occupied.get().clone(),
            MapEntry::Vacant(vacant) => {
              vacant.insert(Arc::new(Slot {
                key: key.clone(),
                state: Mutex::new(SlotState::Present(PresentState {
                  value: Some(value),
                  loaded_at: now,
                  expires_at,
                })),
              }));
              return Ok(());
            }
          }
        }
      };

      let overridden = {
        let mut state = slot.state.lock();
        if matches!(&*state, SlotState::Removed) {
          drop(state);
          continue;
        }
        let overridden = match &*state {
          SlotState::Loading(record) => Some(record.clone()),
          SlotState::Refreshing { record, .. } => Some(record.clone()),
          _ => None,
        };
        if no_cache {
          *state = SlotState::Removed;
        } else {
          *state = SlotState::Present(PresentState {
            value: Some(value.clone()),
            loaded_at: now,
            expires_at,
          });
        }
        overridden
      };
      if no_cache {
        self.store.remove_slot(&key, &slot);
      }
      // Waiters of an overridden load receive the put value right away.
      if let Some(record) = overridden {
        record.complete(Ok(Some(value)));
      }
      return Ok(());
    }
  }

  /// Removes an entry. Waiters of an in-flight load still receive the load
  /// outcome; only the slot is taken out of the map.
  pub(crate) fn remove_entry(&self, key: &K) -> bool {
    if self.is_closed() {
      return false;
    }
    let shard = self.store.get_shard(key);
    let removed = {
      let mut guard = shard.map.write();
      guard.remove(key)
    };
    match removed {
      Some(slot) => {
        let mut state = slot.state.lock();
        let had_data = matches!(
          &*state,
          SlotState::Present(_) | SlotState::Refreshing { .. } | SlotState::Exceptional(_)
        );
        *state = SlotState::Removed;
        had_data
      }
      None => false,
    }
  }

  /// Non-loading value read. A cached non-suppressed failure is an error.
  pub(crate) fn peek_value(&self, key: &K) -> Result<Option<Arc<V>>, CacheError> {
    if self.is_closed() {
      return Ok(None);
    }
    let slot = match self.store.slot(key) {
      Some(slot) => slot,
      None => return Ok(None),
    };
    let state = slot.state.lock();
    let now = time::now_nanos();
    match &*state {
      SlotState::Present(present) if !present.is_expired(now) => {
        Ok(present.value.clone())
      }
      SlotState::Refreshing { current, .. } => Ok(current.value.clone()),
      SlotState::Exceptional(exceptional) => {
        if exceptional.stale.is_some() && now < exceptional.suppress_until {
          Ok(exceptional.stale.as_ref().and_then(|s| s.value.clone()))
        } else {
          Err(CacheError::Loader(LoaderError::from_cause(
            exceptional.info.error.clone(),
          )))
        }
      }
      _ => Ok(None),
    }
  }

  /// Snapshot view of an entry; never loads.
  pub(crate) fn peek_entry_snapshot(&self, key: &K) -> Option<EntrySnapshot<K, V>> {
    if self.is_closed() {
      return None;
    }
    let slot = self.store.slot(key)?;
    let state = slot.state.lock();
    let now = time::now_nanos();
    match &*state {
      SlotState::Present(present) if !present.is_expired(now) => Some(EntrySnapshot {
        key: key.clone(),
        value: present.value.clone(),
        exception: None,
      }),
      SlotState::Refreshing { current, .. } => Some(EntrySnapshot {
        key: key.clone(),
        value: current.value.clone(),
        exception: None,
      }),
      SlotState::Exceptional(exceptional) => {
        let value = if now < exceptional.suppress_until {
          exceptional.stale.as_ref().and_then(|s| s.value.clone())
        } else {
          None
        };
        Some(EntrySnapshot {
          key: key.clone(),
          value,
          exception: Some(exceptional.info.error.clone()),
        })
      }
      _ => None,
    }
  }

  /// True for settled entries, including cached failures. False while the
  /// first load of a key is still in flight.
  pub(crate) fn contains(&self, key: &K) -> bool {
    if self.is_closed() {
      return false;
    }
    let slot = match self.store.slot(key) {
      Some(slot) => slot,
      None => return false,
    };
    let state = slot.state.lock();
    let now = time::now_nanos();
    match &*state {
      SlotState::Present(present) => !present.is_expired(now),
      SlotState::Refreshing { .. } => true,
      SlotState::Exceptional(_) => true,
      _ => false,
    }
  }

  /// Closes the cache. In-flight waiters complete exceptionally; loader
  /// callbacks arriving afterwards are absorbed without effect.
  pub(crate) fn close(&self) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    let mut pending = Vec::new();
    for shard in self.store.iter_shards() {
      let slots: Vec<Arc<Slot<K, V>>> = {
        let mut guard = shard.map.write();
        guard.drain().map(|(_, slot)| slot).collect()
      };
      for slot in slots {
        let mut state = slot.state.lock();
        match std::mem::replace(&mut *state, SlotState::Removed) {
          SlotState::Loading(record) => pending.push(record),
          SlotState::Refreshing { record, .. } => pending.push(record),
          _ => {}
        }
      }
    }
    for record in pending {
      record.complete(Err(CacheError::Closed));
    }
    if let Some(pool) = &self.owned_pool {
      pool.shutdown();
    }
    log::debug!("cache closed");
  }
}
