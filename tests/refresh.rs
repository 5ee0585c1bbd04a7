mod common;

use common::{await_condition, Latch};
use lodestone::{CacheBuilder, Executor, Task, ThreadPool};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn expired_access_serves_stale_and_reloads() {
  let counter = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::default()
    .expire_after_write(Duration::from_millis(100))
    .refresh_ahead(true)
    .loader({
      let counter = counter.clone();
      move |_key: &i32| Ok(Some(counter.fetch_add(1, Ordering::SeqCst) + 1))
    })
    .build()
    .unwrap();

  assert_eq!(*cache.get(&1).unwrap().unwrap(), 1);
  thread::sleep(Duration::from_millis(150));
  // The expired access still answers from the current value.
  assert_eq!(*cache.get(&1).unwrap().unwrap(), 1);
  await_condition("background refresh replaced the value", || {
    cache.peek(&1).unwrap().map(|v| *v) == Some(2)
  });
  assert!(cache.metrics().refreshes >= 1);
}

/// A get that triggers a refresh returns without waiting for the loader.
#[test]
fn refresh_does_not_block_the_caller() {
  let release = Arc::new(Latch::new(1));
  let counter = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::default()
    .expire_after_write(Duration::from_millis(20))
    .refresh_ahead(true)
    .loader({
      let release = release.clone();
      let counter = counter.clone();
      move |_key: &i32| {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        if call > 0 {
          // Only the background reload blocks.
          release.wait();
        }
        Ok(Some(call))
      }
    })
    .build()
    .unwrap();

  cache.get(&1).unwrap();
  thread::sleep(Duration::from_millis(50));
  let begin = Instant::now();
  let value = cache.get(&1).unwrap().unwrap();
  assert_eq!(*value, 0, "stale value answered");
  assert!(
    begin.elapsed() < Duration::from_secs(2),
    "access must not wait for the refresh loader"
  );
  release.count_down();
  await_condition("refresh done", || counter.load(Ordering::SeqCst) >= 2);
}

#[test]
fn refresh_window_triggers_before_expiry() {
  let counter = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::default()
    .expire_after_write(Duration::from_secs(60))
    .refresh_ahead(true)
    .refresh_ahead_window(Duration::from_secs(120))
    .loader({
      let counter = counter.clone();
      move |_key: &i32| Ok(Some(counter.fetch_add(1, Ordering::SeqCst)))
    })
    .build()
    .unwrap();

  cache.get(&1).unwrap();
  // Remaining TTL (60s) is below the window (120s): the access refreshes.
  cache.get(&1).unwrap();
  await_condition("window refresh ran", || {
    counter.load(Ordering::SeqCst) >= 2
  });
  assert!(cache.metrics().refreshes >= 1);
}

struct CountingExecutor {
  used: Arc<AtomicUsize>,
  delegate: Arc<ThreadPool>,
}

impl Executor for CountingExecutor {
  fn execute(&self, task: Task) {
    self.used.fetch_add(1, Ordering::SeqCst);
    self.delegate.execute(task);
  }
}

/// Refresh work goes to the refresh executor, not the loader executor.
#[test]
fn refresh_uses_the_refresh_executor() {
  let refresh_used = Arc::new(AtomicUsize::new(0));
  let pool = Arc::new(ThreadPool::new(2, "refresh-test"));
  let cache = CacheBuilder::default()
    .expire_after_write(Duration::from_millis(20))
    .refresh_ahead(true)
    .refresh_executor(CountingExecutor {
      used: refresh_used.clone(),
      delegate: pool.clone(),
    })
    .loader(|key: &i32| Ok(Some(*key)))
    .build()
    .unwrap();

  cache.get(&1).unwrap();
  assert_eq!(refresh_used.load(Ordering::SeqCst), 0);
  thread::sleep(Duration::from_millis(50));
  cache.get(&1).unwrap();
  await_condition("refresh executor used", || {
    refresh_used.load(Ordering::SeqCst) == 1
  });
}

/// An entry processor can request a refresh explicitly; the loader then
/// observes the current entry.
#[test]
fn processor_requested_refresh_sees_current_entry() {
  let saw_entry = Arc::new(Latch::new(1));
  let cache = CacheBuilder::default()
    .refresh_ahead(true)
    .expire_after_write(Duration::from_secs(60))
    .async_loader({
      let saw_entry = saw_entry.clone();
      move |key: &i32, ctx, callback| {
        if ctx.current_entry().unwrap().is_some() {
          saw_entry.count_down();
        }
        callback.on_load_success(Some(*key)).unwrap();
        Ok(())
      }
    })
    .build()
    .unwrap();

  cache.get(&1).unwrap();
  cache.load_all(vec![1, 2, 3, 4, 5]).wait().unwrap();
  cache
    .invoke_all(vec![2, 3, 4], |entry| {
      entry.schedule_refresh();
      Ok(())
    })
    .unwrap();
  saw_entry.wait();
}

/// A failed refresh without resilience drops the entry; the next access
/// loads fresh.
#[test]
fn failed_refresh_without_resilience_drops_entry() {
  let counter = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::default()
    .expire_after_write(Duration::from_millis(20))
    .refresh_ahead(true)
    .loader({
      let counter = counter.clone();
      move |key: &i32| {
        if counter.fetch_add(1, Ordering::SeqCst) == 1 {
          Err(Box::new(common::ExpectedError))
        } else {
          Ok(Some(*key))
        }
      }
    })
    .build()
    .unwrap();

  cache.get(&7).unwrap();
  thread::sleep(Duration::from_millis(50));
  cache.get(&7).unwrap();
  await_condition("entry dropped after failed refresh", || {
    !cache.contains_key(&7)
  });
  assert_eq!(*cache.get(&7).unwrap().unwrap(), 7);
}
