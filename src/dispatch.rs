use crate::bulk::{BulkCallback, BulkLoaderContext, BulkRequest};
use crate::loader::{LoadCallback, Loader, LoaderContext};
use crate::metrics::Metrics;
use crate::runtime::Task;
use crate::shared::{CacheShared, StartedLoad};
use crate::time;

use std::hash::{BuildHasher, Hash};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Where the result of a dispatched load is consumed, which decides the
/// executor policy.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchHint {
  /// The caller blocks on the result anyway; sync loaders run on the
  /// caller thread.
  Blocking,
  /// The caller holds a completion handle; sync loaders are offloaded to
  /// the loader executor, falling back to the caller thread when the pool
  /// has no idle worker. The handle absorbs the inline run either way.
  Background,
  /// Refresh-ahead: must never run on the accessing caller, so the work is
  /// queued on the refresh executor unconditionally.
  Refresh,
}

impl<K, V, H> CacheShared<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Runs the started loads through the configured loader shape. With a
  /// bulk loader the whole group becomes a single bulk call; otherwise each
  /// key is dispatched on its own.
  ///
  /// Async loaders are always invoked inline: they return promptly by
  /// contract and do their blocking work via the context executors.
  pub(crate) fn dispatch_loads(
    self: &Arc<Self>,
    starts: Vec<StartedLoad<K, V>>,
    hint: DispatchHint,
  ) {
    if starts.is_empty() {
      return;
    }
    let loader = match &self.loader {
      Some(loader) => loader.clone(),
      None => {
        // No loader configured; nothing can materialize these records.
        for start in starts {
          start.record.complete(Ok(None));
        }
        return;
      }
    };
    for _ in 0..starts.len() {
      Metrics::count(&self.metrics.loads);
    }
    match loader {
      Loader::Sync(load) => {
        for start in starts {
          let shared = self.clone();
          let load = load.clone();
          let task: Task = Box::new(move || {
            let result = load(&start.slot.key).map_err(Arc::from);
            shared.complete_load(&start.slot, &start.record, result);
          });
          self.run_or_offload(hint, task);
        }
      }
      Loader::Advanced(load) => {
        for start in starts {
          let shared = self.clone();
          let load = load.clone();
          let task: Task = Box::new(move || {
            let result = load(
              &start.slot.key,
              time::nanos_to_instant(start.record.started_at),
              start.record.snapshot.as_ref(),
            )
            .map_err(Arc::from);
            shared.complete_load(&start.slot, &start.record, result);
          });
          self.run_or_offload(hint, task);
        }
      }
      Loader::Async(load) => {
        for start in starts {
          let context = LoaderContext {
            shared: self.clone(),
            record: start.record.clone(),
          };
          let callback = LoadCallback {
            shared: self.clone(),
            slot: start.slot.clone(),
            record: start.record,
            used: Arc::new(AtomicBool::new(false)),
          };
          if let Err(error) = load(&start.slot.key, &context, callback.clone()) {
            // An error return before the callback fired fails the load.
            callback.fail_from_return(error);
          }
        }
      }
      Loader::Bulk(load) => {
        let request = BulkRequest::new(self.clone(), starts);
        Metrics::count(&self.metrics.bulk_requests);
        let keys: Vec<K> = request.keys().to_vec();
        let task: Task = Box::new(move || {
          let result = load(&keys);
          request.apply_sync_result(result);
        });
        self.run_or_offload(hint, task);
      }
      Loader::AsyncBulk(load) => {
        let request = BulkRequest::new(self.clone(), starts);
        Metrics::count(&self.metrics.bulk_requests);
        let context = BulkLoaderContext {
          shared: self.clone(),
          request: request.clone(),
        };
        let callback = BulkCallback {
          request: request.clone(),
        };
        if let Err(error) = load(request.keys(), &context, callback) {
          request.abort_remaining(Arc::from(error));
        }
      }
    }
  }

  fn run_or_offload(&self, hint: DispatchHint, task: Task) {
    match hint {
      DispatchHint::Blocking => task(),
      DispatchHint::Background => {
        if let Err(task) = self.loader_executor.try_execute(task) {
          // Saturated pool: the caller thread absorbs the load.
          log::debug!("loader executor saturated, running load on caller");
          task();
        }
      }
      DispatchHint::Refresh => self.refresh_executor.execute(task),
    }
  }
}
