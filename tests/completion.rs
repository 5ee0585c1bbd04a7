mod common;

use common::{AlwaysFail, Latch};
use lodestone::{CacheBuilder, CacheError};

use futures_util::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn empty_request_is_done_immediately() {
  let cache = CacheBuilder::default()
    .loader(|key: &i32| Ok(Some(*key)))
    .build()
    .unwrap();

  let future = cache.load_all(Vec::new());
  assert!(future.is_done());
  assert!(!future.is_completed_exceptionally());
  future.wait().unwrap();
}

#[test]
fn on_complete_fires_immediately_when_done() {
  let cache = CacheBuilder::default()
    .loader(|key: &i32| Ok(Some(*key)))
    .build()
    .unwrap();

  let future = cache.load_all(vec![1, 2]);
  future.wait().unwrap();
  let fired = Arc::new(AtomicUsize::new(0));
  future.on_complete({
    let fired = fired.clone();
    move |result| {
      result.unwrap();
      fired.fetch_add(1, Ordering::SeqCst);
    }
  });
  assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn exceptional_completion_is_queryable() {
  let cache = CacheBuilder::default()
    .loader(|_key: &i32| -> Result<Option<i32>, lodestone::BoxError> { Err(Box::new(AlwaysFail)) })
    .build()
    .unwrap();

  let future = cache.load_all(vec![1]);
  let _ = future.wait();
  assert!(future.is_done());
  assert!(future.is_completed_exceptionally());
}

#[test]
fn failure_capture_through_on_complete() {
  let cache = CacheBuilder::default()
    .loader(|_key: &i32| -> Result<Option<i32>, lodestone::BoxError> { Err(Box::new(AlwaysFail)) })
    .build()
    .unwrap();

  let captured = Arc::new(AtomicUsize::new(0));
  let done = Arc::new(Latch::new(1));
  let future = cache.load_all(vec![1, 2]);
  future.on_complete({
    let captured = captured.clone();
    let done = done.clone();
    move |result| {
      if let Err(CacheError::Loader(envelope)) = result {
        if envelope.cause().unwrap().downcast_ref::<AlwaysFail>().is_some() {
          captured.fetch_add(1, Ordering::SeqCst);
        }
      }
      done.count_down();
    }
  });
  done.wait();
  assert_eq!(captured.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn completion_future_can_be_awaited() {
  let release = Arc::new(Latch::new(1));
  let cache = CacheBuilder::default()
    .async_loader({
      let release = release.clone();
      move |key: &i32, ctx, callback| {
        let release = release.clone();
        let key = *key;
        ctx.loader_executor().execute(Box::new(move || {
          release.wait();
          callback.on_load_success(Some(key)).unwrap();
        }));
        Ok(())
      }
    })
    .build()
    .unwrap();

  let futures = vec![
    cache.load_all(vec![1, 2]),
    cache.load_all(vec![2, 3]),
    cache.load_all(vec![3, 4]),
  ];
  release.count_down();
  let results = join_all(futures).await;
  for result in results {
    result.unwrap();
  }
  assert_eq!(*cache.peek(&3).unwrap().unwrap(), 3);
}

#[tokio::test]
async fn awaiting_an_already_done_future() {
  let cache = CacheBuilder::default()
    .loader(|key: &i32| Ok(Some(*key)))
    .build()
    .unwrap();

  let future = cache.load_all(vec![7]);
  future.clone().await.unwrap();
  future.await.unwrap();
  assert_eq!(*cache.peek(&7).unwrap().unwrap(), 7);
}
