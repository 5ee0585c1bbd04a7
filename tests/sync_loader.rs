mod common;

use common::await_condition;
use lodestone::{CacheBuilder, NullValueError};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn loader_basic() {
  let cache = CacheBuilder::default()
    .loader(|key: &i32| Ok(Some(key * 2)))
    .build()
    .unwrap();

  assert_eq!(*cache.get(&5).unwrap().unwrap(), 10);
  assert_eq!(*cache.get(&10).unwrap().unwrap(), 20);
  assert!(!cache.contains_key(&2));
  assert!(cache.contains_key(&5));
}

#[test]
fn loader_not_called_again_for_present_key() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::default()
    .loader({
      let load_count = load_count.clone();
      move |key: &i32| {
        load_count.fetch_add(1, Ordering::SeqCst);
        Ok(Some(key * 10))
      }
    })
    .build()
    .unwrap();

  assert_eq!(*cache.get(&5).unwrap().unwrap(), 50);
  assert_eq!(load_count.load(Ordering::SeqCst), 1);
  assert_eq!(*cache.get(&5).unwrap().unwrap(), 50);
  assert_eq!(load_count.load(Ordering::SeqCst), 1, "second get is a hit");
  assert_eq!(cache.metrics().hits, 1);
}

/// `load_all` skips keys that already have a value; each missing key is
/// loaded exactly once.
#[test]
fn load_all_loads_only_missing_keys() {
  let counter = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::default()
    .loader({
      let counter = counter.clone();
      move |_key: &i32| Ok(Some(counter.fetch_add(1, Ordering::SeqCst) + 1))
    })
    .build()
    .unwrap();

  assert_eq!(*cache.get(&5).unwrap().unwrap(), 1);
  cache.load_all(vec![5, 6]).wait().unwrap();
  assert_eq!(counter.load(Ordering::SeqCst), 2);
  assert_eq!(*cache.get(&6).unwrap().unwrap(), 2);
  cache.load_all(vec![5, 6]).wait().unwrap();
  assert_eq!(counter.load(Ordering::SeqCst), 2);
  cache.load_all(Vec::new()).wait().unwrap();
}

/// `reload_all` forces a load for every key, present or not.
#[test]
fn reload_all_forces_loads() {
  let counter = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::default()
    .loader({
      let counter = counter.clone();
      move |_key: &i32| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Some(0))
      }
    })
    .build()
    .unwrap();

  cache.get(&5).unwrap();
  assert_eq!(counter.load(Ordering::SeqCst), 1);
  cache.reload_all(vec![5, 6]).wait().unwrap();
  assert_eq!(counter.load(Ordering::SeqCst), 3);
  cache.reload_all(Vec::<i32>::new()).wait().unwrap();
}

#[test]
fn thundering_herd_causes_one_load() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let num_threads = 20;

  let cache = Arc::new(
    CacheBuilder::default()
      .loader({
        let load_count = load_count.clone();
        move |key: &i32| {
          // Simulate a slow backend call.
          thread::sleep(Duration::from_millis(100));
          load_count.fetch_add(1, Ordering::SeqCst);
          Ok(Some(key * 10))
        }
      })
      .build()
      .unwrap(),
  );

  let barrier = Arc::new(Barrier::new(num_threads));
  let mut handles = vec![];
  for _ in 0..num_threads {
    let cache = cache.clone();
    let barrier = barrier.clone();
    handles.push(thread::spawn(move || {
      barrier.wait();
      let value = cache.get(&99).unwrap().unwrap();
      assert_eq!(*value, 990);
    }));
  }
  for handle in handles {
    handle.join().unwrap();
  }

  assert_eq!(
    load_count.load(Ordering::SeqCst),
    1,
    "all concurrent callers must share one load"
  );
  assert_eq!(cache.metrics().misses, 1);
  assert_eq!(cache.metrics().hits, (num_threads - 1) as u64);
}

#[test]
fn null_value_permitted() {
  let cache = CacheBuilder::default()
    .loader(|_key: &i32| Ok(None::<i32>))
    .permit_null_values(true)
    .build()
    .unwrap();

  assert!(cache.get(&5).unwrap().is_none());
  assert!(cache.contains_key(&5), "null entry is settled data");
}

#[test]
fn null_value_rejected() {
  let cache = CacheBuilder::default()
    .loader(|_key: &i32| Ok(None::<i32>))
    .build()
    .unwrap();

  let err = cache.get(&5).unwrap_err();
  let loader_err = err.loader_error().expect("loader error envelope");
  assert!(
    loader_err.cause().unwrap().downcast_ref::<NullValueError>().is_some(),
    "cause must be the null marker"
  );
  assert!(!cache.contains_key(&5));
}

/// An expiry policy returning a zero duration means "do not cache": the
/// null result is passed through without an error and nothing is stored.
#[test]
fn null_with_immediate_expiry_is_not_cached() {
  let cache = CacheBuilder::default()
    .loader(|_key: &i32| Ok(None::<i32>))
    .expiry_policy(|_key, _value, _load_time| Some(Duration::ZERO))
    .build()
    .unwrap();

  assert!(cache.get(&5).unwrap().is_none());
  assert!(!cache.contains_key(&5));
}

#[test]
fn advanced_loader_sees_no_entry_on_miss() {
  let cache = CacheBuilder::default()
    .advanced_loader(|key: &i32, _start, current| {
      assert!(current.is_none());
      Ok(Some(key * 2))
    })
    .build()
    .unwrap();

  assert_eq!(*cache.get(&5).unwrap().unwrap(), 10);
  assert_eq!(*cache.get(&10).unwrap().unwrap(), 20);
  assert!(!cache.contains_key(&2));
  assert!(cache.contains_key(&5));
}

#[test]
fn advanced_loader_entry_not_set_if_expired() {
  let cache = CacheBuilder::default()
    .expire_after_write(Duration::from_millis(30))
    .advanced_loader(|key: &i32, _start, current| {
      assert!(current.is_none(), "expired entry must not be passed");
      Ok(Some(*key))
    })
    .build()
    .unwrap();

  cache.get(&123).unwrap();
  thread::sleep(Duration::from_millis(60));
  cache.get(&123).unwrap();
}

#[test]
fn advanced_loader_entry_set_if_expired_with_keep_data() {
  let expect_entry = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::default()
    .expire_after_write(Duration::from_millis(30))
    .keep_data_after_expired(true)
    .advanced_loader({
      let expect_entry = expect_entry.clone();
      move |key: &i32, _start, current| {
        if expect_entry.load(Ordering::SeqCst) == 1 {
          let entry = current.expect("kept entry must be passed");
          assert_eq!(**entry.value().unwrap(), 123);
        } else {
          assert!(current.is_none());
        }
        Ok(Some(*key))
      }
    })
    .build()
    .unwrap();

  cache.get(&123).unwrap();
  thread::sleep(Duration::from_millis(60));
  expect_entry.store(1, Ordering::SeqCst);
  cache.get(&123).unwrap();
}

/// A get with no loader configured is a plain map read.
#[test]
fn no_loader_behaves_like_plain_map() {
  let cache: lodestone::Cache<i32, i32> = CacheBuilder::default().build().unwrap();
  assert!(cache.get(&1).unwrap().is_none());
  cache.put(1, 10).unwrap();
  assert_eq!(*cache.get(&1).unwrap().unwrap(), 10);
  assert!(cache.remove(&1));
  assert!(cache.get(&1).unwrap().is_none());
}

/// A put that lands while the key is loading wins: waiters observe the put
/// value and the loader's late result is discarded.
#[test]
fn put_overrides_inflight_load() {
  let entered = Arc::new(common::Latch::new(1));
  let release = Arc::new(common::Latch::new(1));
  let cache = Arc::new(
    CacheBuilder::default()
      .loader({
        let entered = entered.clone();
        let release = release.clone();
        move |_key: &i32| {
          entered.count_down();
          release.wait();
          Ok(Some(1))
        }
      })
      .build()
      .unwrap(),
  );

  let getter = {
    let cache = cache.clone();
    thread::spawn(move || *cache.get(&7).unwrap().unwrap())
  };
  entered.wait();
  cache.put(7, 42).unwrap();
  release.count_down();
  assert_eq!(getter.join().unwrap(), 42, "waiter sees the put value");
  await_condition("late load result discarded", || {
    cache.peek(&7).unwrap().map(|v| *v) == Some(42)
  });
}
