use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

/// A unit of work submitted to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A trait for running loader work on caller-chosen threads.
///
/// The cache never spawns threads of its own outside the executors it is
/// configured with; loads, refreshes and bulk calls are all funneled through
/// this trait.
pub trait Executor: Send + Sync + 'static {
  /// Runs the task, queueing if no thread is immediately available.
  fn execute(&self, task: Task);

  /// Runs the task only if a thread can pick it up right away. On rejection
  /// the task is handed back so the caller can run it inline.
  fn try_execute(&self, task: Task) -> Result<(), Task> {
    self.execute(task);
    Ok(())
  }
}

struct PoolState {
  queue: VecDeque<Task>,
  idle: usize,
  shutdown: bool,
}

struct PoolInner {
  state: Mutex<PoolState>,
  available: Condvar,
}

/// The default loader thread pool.
///
/// `try_execute` uses direct handoff semantics: a task is accepted only when
/// an idle worker can take it immediately, otherwise it is rejected and the
/// caller runs it on its own thread. `execute` always queues; it is used for
/// refresh work that must never run on (and block) the accessing caller.
pub struct ThreadPool {
  inner: Arc<PoolInner>,
}

impl ThreadPool {
  /// Spawns `threads` workers. The loading pipeline expects at least two so
  /// that overlapping loads can make progress independently.
  pub fn new(threads: usize, name_prefix: &str) -> Self {
    let inner = Arc::new(PoolInner {
      state: Mutex::new(PoolState {
        queue: VecDeque::new(),
        idle: 0,
        shutdown: false,
      }),
      available: Condvar::new(),
    });
    for i in 0..threads.max(1) {
      let inner = inner.clone();
      let _ = thread::Builder::new()
        .name(format!("{}-{}", name_prefix, i))
        .spawn(move || Self::worker_loop(inner));
    }
    ThreadPool { inner }
  }

  fn worker_loop(inner: Arc<PoolInner>) {
    loop {
      let task = {
        let mut state = inner.state.lock();
        loop {
          if let Some(task) = state.queue.pop_front() {
            break task;
          }
          if state.shutdown {
            return;
          }
          state.idle += 1;
          inner.available.wait(&mut state);
          state.idle -= 1;
        }
      };
      task();
    }
  }

  /// Stops all workers after the queued tasks have been drained.
  pub fn shutdown(&self) {
    let mut state = self.inner.state.lock();
    state.shutdown = true;
    self.inner.available.notify_all();
  }
}

impl Drop for ThreadPool {
  fn drop(&mut self) {
    self.shutdown();
  }
}

impl Executor for ThreadPool {
  fn execute(&self, task: Task) {
    let mut state = self.inner.state.lock();
    if state.shutdown {
      // Late refresh work after shutdown is dropped; the cache is closing.
      return;
    }
    state.queue.push_back(task);
    self.inner.available.notify_one();
  }

  fn try_execute(&self, task: Task) -> Result<(), Task> {
    let mut state = self.inner.state.lock();
    if state.shutdown || state.queue.len() >= state.idle {
      return Err(task);
    }
    state.queue.push_back(task);
    self.inner.available.notify_one();
    Ok(())
  }
}

impl Executor for Arc<ThreadPool> {
  fn execute(&self, task: Task) {
    (**self).execute(task)
  }

  fn try_execute(&self, task: Task) -> Result<(), Task> {
    (**self).try_execute(task)
  }
}

/// Process-wide executor handed to loaders through the context as the
/// general-purpose executor. Shared by all caches, never shut down.
pub(crate) static COMMON_EXECUTOR: Lazy<Arc<ThreadPool>> =
  Lazy::new(|| Arc::new(ThreadPool::new(num_cpus::get().max(2), "lodestone-common")));

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  #[test]
  fn executes_queued_tasks() {
    let pool = ThreadPool::new(2, "test-pool");
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
      let counter = counter.clone();
      pool.execute(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
      }));
    }
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while counter.load(Ordering::SeqCst) < 16 {
      assert!(std::time::Instant::now() < deadline, "tasks not drained");
      thread::yield_now();
    }
  }

  #[test]
  fn try_execute_rejects_when_busy() {
    let pool = ThreadPool::new(1, "test-busy");
    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
    // Give the single worker a moment to register as idle.
    thread::sleep(Duration::from_millis(50));
    pool
      .try_execute(Box::new(move || {
        started_tx.send(()).unwrap();
        gate_rx.recv().unwrap();
      }))
      .ok()
      .expect("idle worker should accept the task");
    started_rx.recv().unwrap();
    // Worker is now blocked; a handoff must be rejected.
    assert!(pool.try_execute(Box::new(|| {})).is_err());
    gate_tx.send(()).unwrap();
  }
}
