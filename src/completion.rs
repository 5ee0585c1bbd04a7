use crate::error::{CacheError, LoaderError};

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, Thread};

type Continuation = Box<dyn FnOnce(Result<(), CacheError>) + Send>;

enum CompletionState {
  Pending {
    threads: Vec<Thread>,
    wakers: Vec<Waker>,
    continuations: Vec<Continuation>,
  },
  Done(Result<(), CacheError>),
}

/// Result handle returned by `load_all` and `reload_all`.
///
/// The handle resolves once every requested key has completed, successfully
/// or with a captured exception. It can be queried, blocked on from a plain
/// thread, chained with [`on_complete`](CompletionFuture::on_complete), or
/// awaited: it is a `std` future with no runtime requirements.
#[derive(Clone)]
pub struct CompletionFuture {
  inner: Arc<Mutex<CompletionState>>,
}

impl CompletionFuture {
  pub(crate) fn pending() -> Self {
    CompletionFuture {
      inner: Arc::new(Mutex::new(CompletionState::Pending {
        threads: Vec::new(),
        wakers: Vec::new(),
        continuations: Vec::new(),
      })),
    }
  }

  /// An already-resolved handle.
  pub(crate) fn done(result: Result<(), CacheError>) -> Self {
    CompletionFuture {
      inner: Arc::new(Mutex::new(CompletionState::Done(result))),
    }
  }

  /// Resolves the handle and wakes every waiter. First resolution wins.
  pub(crate) fn complete(&self, result: Result<(), CacheError>) {
    let previous = {
      let mut state = self.inner.lock();
      if matches!(&*state, CompletionState::Done(_)) {
        return;
      }
      std::mem::replace(&mut *state, CompletionState::Done(result.clone()))
    };
    if let CompletionState::Pending {
      threads,
      wakers,
      continuations,
    } = previous
    {
      for t in threads {
        t.unpark();
      }
      for w in wakers {
        w.wake();
      }
      for c in continuations {
        c(result.clone());
      }
    }
  }

  pub fn is_done(&self) -> bool {
    matches!(&*self.inner.lock(), CompletionState::Done(_))
  }

  pub fn is_completed_exceptionally(&self) -> bool {
    matches!(&*self.inner.lock(), CompletionState::Done(Err(_)))
  }

  /// Registers a continuation invoked with the final result. Runs on the
  /// completing thread, or immediately on this one if already resolved.
  pub fn on_complete<F>(&self, f: F)
  where
    F: FnOnce(Result<(), CacheError>) + Send + 'static,
  {
    let mut state = self.inner.lock();
    match &mut *state {
      CompletionState::Done(result) => {
        let result = result.clone();
        drop(state);
        f(result);
      }
      CompletionState::Pending { continuations, .. } => {
        continuations.push(Box::new(f));
      }
    }
  }

  /// Blocks the calling thread until the handle resolves.
  pub fn wait(&self) -> Result<(), CacheError> {
    let mut state = self.inner.lock();
    loop {
      match &mut *state {
        CompletionState::Done(result) => return result.clone(),
        CompletionState::Pending { threads, .. } => {
          threads.push(thread::current());
          drop(state);
          thread::park();
          state = self.inner.lock();
        }
      }
    }
  }
}

impl Future for CompletionFuture {
  type Output = Result<(), CacheError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut state = self.inner.lock();
    match &mut *state {
      CompletionState::Done(result) => Poll::Ready(result.clone()),
      CompletionState::Pending { wakers, .. } => {
        wakers.push(cx.waker().clone());
        Poll::Pending
      }
    }
  }
}

/// Fans per-key completions into a single [`CompletionFuture`].
///
/// Every key of a bulk operation reports here exactly once; the last report
/// resolves the future, aggregating captured failures into one envelope.
pub(crate) struct CompletionSink {
  future: CompletionFuture,
  remaining: AtomicUsize,
  total: usize,
  style: AggregateStyle,
  failures: Mutex<Vec<CacheError>>,
}

/// How an aggregated failure renders its counts. The message shapes are a
/// documented part of the error contract, so the choice is made explicit at
/// the operation's call site.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum AggregateStyle {
  /// "<n> loader exceptions" — coalescing operations that only know which
  /// keys failed.
  CountOnly,
  /// "<n> out of <m> loads failed" — operations that forced a load per
  /// requested key, where the proportion is meaningful.
  CountOfTotal,
}

impl CompletionSink {
  pub(crate) fn new(keys: usize, style: AggregateStyle) -> Arc<Self> {
    Arc::new(CompletionSink {
      future: CompletionFuture::pending(),
      remaining: AtomicUsize::new(keys),
      total: keys,
      style,
      failures: Mutex::new(Vec::new()),
    })
  }

  pub(crate) fn future(&self) -> CompletionFuture {
    self.future.clone()
  }

  pub(crate) fn key_done(&self, failure: Option<CacheError>) {
    if let Some(err) = failure {
      self.failures.lock().push(err);
    }
    if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.finish();
    }
  }

  fn finish(&self) {
    let failures = std::mem::take(&mut *self.failures.lock());
    if failures.is_empty() {
      self.future.complete(Ok(()));
      return;
    }
    // A close during the operation trumps loader failures.
    if failures.iter().any(|e| matches!(e, CacheError::Closed)) {
      self.future.complete(Err(CacheError::Closed));
      return;
    }
    let loader_errors: Vec<LoaderError> = failures
      .into_iter()
      .filter_map(|e| match e {
        CacheError::Loader(le) => Some(le),
        _ => None,
      })
      .collect();
    let total = match self.style {
      AggregateStyle::CountOfTotal => Some(self.total),
      AggregateStyle::CountOnly => None,
    };
    self
      .future
      .complete(Err(CacheError::Loader(LoaderError::aggregate(
        loader_errors,
        total,
      ))));
  }
}
