use crate::entry::{EntrySnapshot, PresentState};
use crate::error::CacheError;

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, Thread};

/// What a completed load delivers to each waiter: the (possibly null) value,
/// or the error envelope. A suppressed failure delivers the stale value.
pub(crate) type LoadOutcome<V> = Result<Option<Arc<V>>, CacheError>;

pub(crate) type Continuation<V> = Box<dyn FnOnce(&LoadOutcome<V>) + Send>;

/// Bookkeeping for one in-flight load of one key.
///
/// Every caller that arrives while the load is running attaches here, either
/// as a parked thread or as a continuation closure, and receives exactly one
/// completion. The record completes at most once; late completions (a loader
/// finishing after a `put` took over the slot) are dropped silently.
pub(crate) struct LoadRecord<K, V> {
  pub(crate) key: K,
  pub(crate) started_at: u64,
  /// A detached record belongs to a forced reload that runs alongside
  /// whatever the slot currently holds. Its completion is always applied to
  /// the slot, in completion order.
  pub(crate) detached: bool,
  /// Entry view handed to advanced and async loaders as the current entry.
  pub(crate) snapshot: Option<EntrySnapshot<K, V>>,
  /// Value that was live when the load started; kept for suppression.
  pub(crate) prior: Option<PresentState<V>>,
  /// Failure-streak continuation: (streak start, previous retry count).
  pub(crate) prior_exception: Option<(u64, u32)>,
  inner: Mutex<RecordInner<V>>,
}

struct RecordInner<V> {
  outcome: Option<LoadOutcome<V>>,
  threads: Vec<Thread>,
  continuations: Vec<Continuation<V>>,
}

impl<K, V> LoadRecord<K, V> {
  pub(crate) fn new(
    key: K,
    started_at: u64,
    detached: bool,
    snapshot: Option<EntrySnapshot<K, V>>,
    prior: Option<PresentState<V>>,
    prior_exception: Option<(u64, u32)>,
  ) -> Arc<Self> {
    Arc::new(LoadRecord {
      key,
      started_at,
      detached,
      snapshot,
      prior,
      prior_exception,
      inner: Mutex::new(RecordInner {
        outcome: None,
        threads: Vec::new(),
        continuations: Vec::new(),
      }),
    })
  }

  pub(crate) fn is_done(&self) -> bool {
    self.inner.lock().outcome.is_some()
  }

  /// Delivers the outcome to every waiter. Returns false if the record was
  /// already completed; the late outcome is discarded in that case.
  ///
  /// Must not be called while holding a slot lock: continuations run on
  /// this thread before the call returns.
  pub(crate) fn complete(&self, outcome: LoadOutcome<V>) -> bool {
    let (threads, continuations) = {
      let mut inner = self.inner.lock();
      if inner.outcome.is_some() {
        return false;
      }
      inner.outcome = Some(outcome.clone());
      (
        std::mem::take(&mut inner.threads),
        std::mem::take(&mut inner.continuations),
      )
    };
    for t in threads {
      t.unpark();
    }
    for c in continuations {
      c(&outcome);
    }
    true
  }

  /// Registers a continuation, running it immediately when the load has
  /// already completed.
  pub(crate) fn on_complete(&self, f: Continuation<V>) {
    let mut inner = self.inner.lock();
    if let Some(outcome) = inner.outcome.clone() {
      drop(inner);
      f(&outcome);
    } else {
      inner.continuations.push(f);
    }
  }

  /// Parks the calling thread until the load completes.
  pub(crate) fn wait_blocking(&self) -> LoadOutcome<V> {
    let mut inner = self.inner.lock();
    loop {
      if let Some(outcome) = &inner.outcome {
        return outcome.clone();
      }
      inner.threads.push(thread::current());
      drop(inner);
      thread::park();
      inner = self.inner.lock();
    }
  }
}
