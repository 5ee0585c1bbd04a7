#![allow(dead_code)]

use lodestone::BulkCallback;

use ahash::HashMap;
use std::collections::HashMap as StdHashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(10);

/// Simple marker error used by failing loaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlwaysFail;

impl fmt::Display for AlwaysFail {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "always failing loader")
  }
}

impl std::error::Error for AlwaysFail {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedError;

impl fmt::Display for ExpectedError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "expected test error")
  }
}

impl std::error::Error for ExpectedError {}

/// Counts down from n; waiters block until zero.
pub struct Latch {
  count: Mutex<usize>,
  cond: Condvar,
}

impl Latch {
  pub fn new(count: usize) -> Self {
    Latch {
      count: Mutex::new(count),
      cond: Condvar::new(),
    }
  }

  pub fn count_down(&self) {
    let mut count = self.count.lock().unwrap();
    if *count > 0 {
      *count -= 1;
      if *count == 0 {
        self.cond.notify_all();
      }
    }
  }

  pub fn wait(&self) {
    let mut count = self.count.lock().unwrap();
    let deadline = Instant::now() + WAIT;
    while *count > 0 {
      let remaining = deadline.saturating_duration_since(Instant::now());
      assert!(!remaining.is_zero(), "timeout waiting for latch");
      let (guard, _) = self.cond.wait_timeout(count, remaining).unwrap();
      count = guard;
    }
  }
}

/// Polls a condition until it holds or the shared test timeout elapses.
pub fn await_condition(what: &str, mut check: impl FnMut() -> bool) {
  let deadline = Instant::now() + WAIT;
  while !check() {
    assert!(Instant::now() < deadline, "timeout: {}", what);
    std::thread::yield_now();
    std::thread::sleep(Duration::from_millis(1));
  }
}

/// Captures async bulk load requests so tests can complete them out of
/// band, per key or with one map per bulk request.
pub struct AsyncLoadBuffer<K, V> {
  pending: Mutex<StdHashMap<K, BulkCallback<K, V>>>,
  cond: Condvar,
  loader: Box<dyn Fn(&K) -> V + Send + Sync>,
  started: AtomicUsize,
}

impl<K, V> AsyncLoadBuffer<K, V>
where
  K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
{
  pub fn new(loader: impl Fn(&K) -> V + Send + Sync + 'static) -> Self {
    AsyncLoadBuffer {
      pending: Mutex::new(StdHashMap::new()),
      cond: Condvar::new(),
      loader: Box::new(loader),
      started: AtomicUsize::new(0),
    }
  }

  /// Registers a pending load; fails when one is already pending for the
  /// key.
  pub fn put(&self, key: K, callback: BulkCallback<K, V>) {
    let mut pending = self.pending.lock().unwrap();
    self.started.fetch_add(1, Ordering::SeqCst);
    let previous = pending.insert(key, callback);
    assert!(previous.is_none(), "request already pending for key");
    self.cond.notify_all();
  }

  /// Completes one key through its per-key callback.
  pub fn complete(&self, key: K) {
    let callback = self
      .pending
      .lock()
      .unwrap()
      .remove(&key)
      .expect("no pending load for key");
    callback
      .on_load_success(&key, Some((self.loader)(&key)))
      .expect("per-key completion failed");
  }

  /// Completes a set of keys through a single whole-bulk map completion;
  /// the keys must belong to the same bulk request.
  pub fn bulk_complete(&self, keys: &[K]) {
    let (callback, map) = {
      let mut pending = self.pending.lock().unwrap();
      let callback = pending
        .remove(&keys[0])
        .expect("no pending load for first key");
      let mut map: HashMap<K, V> = HashMap::default();
      map.insert(keys[0].clone(), (self.loader)(&keys[0]));
      for key in &keys[1..] {
        pending.remove(key).expect("no pending load for key");
        map.insert(key.clone(), (self.loader)(key));
      }
      (callback, map)
    };
    callback
      .on_bulk_success(map)
      .expect("bulk completion failed");
  }

  pub fn assert_started(&self, keys: &[K]) {
    let pending = self.pending.lock().unwrap();
    for key in keys {
      assert!(pending.contains_key(key), "load not pending for key");
    }
  }

  /// Blocks until a load was started for each of the keys.
  pub fn await_started(&self, keys: &[K]) {
    let deadline = Instant::now() + WAIT;
    let mut pending = self.pending.lock().unwrap();
    for key in keys {
      while !pending.contains_key(key) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(!remaining.is_zero(), "load not started before timeout");
        let (guard, _) = self.cond.wait_timeout(pending, remaining).unwrap();
        pending = guard;
      }
    }
  }

  pub fn started_load_requests(&self) -> usize {
    self.started.load(Ordering::SeqCst)
  }
}
