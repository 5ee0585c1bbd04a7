use crate::bulk::{BulkCallback, BulkLoaderContext};
use crate::error::{BoxError, BuildError};
use crate::handles::Cache;
use crate::loader::{LoadCallback, Loader, LoaderContext};
use crate::metrics::Metrics;
use crate::resilience::{ResilienceConfig, ResiliencePolicy, UniversalResiliencePolicy};
use crate::runtime::{Executor, ThreadPool, COMMON_EXECUTOR};
use crate::shared::{CacheShared, ExpiryFn};
use crate::store::ShardedStore;
use crate::time;
use crate::entry::EntrySnapshot;

use ahash::HashMap;
use core::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A builder for [`Cache`] instances.
///
/// A cache without a loader behaves as a plain map with `put`/`peek`; with
/// one of the five loader shapes configured, reads that miss run the loader
/// and coalesce concurrent callers onto a single in-flight load per key.
pub struct CacheBuilder<K, V, H = ahash::RandomState> {
  shards: usize,
  hasher: H,
  loader: Option<Loader<K, V, H>>,
  loader_conflict: bool,
  loader_executor: Option<Arc<dyn Executor>>,
  refresh_executor: Option<Arc<dyn Executor>>,
  loader_thread_count: usize,
  permit_null_values: bool,
  expire_after_write: Option<Duration>,
  expiry_policy: Option<ExpiryFn<K, V>>,
  refresh_ahead: bool,
  refresh_ahead_window: Option<Duration>,
  keep_data_after_expired: bool,
  resilience: ResilienceConfig,
  resilience_policy: Option<Arc<dyn ResiliencePolicy>>,
  _key_marker: PhantomData<K>,
  _value_marker: PhantomData<V>,
}

impl<K, V, H> fmt::Debug for CacheBuilder<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheBuilder")
      .field("shards", &self.shards)
      .field("expire_after_write", &self.expire_after_write)
      .field("refresh_ahead", &self.refresh_ahead)
      .field("has_loader", &self.loader.is_some())
      .finish_non_exhaustive()
  }
}

impl<K, V, H: BuildHasher + Default> CacheBuilder<K, V, H> {
  /// Creates a new builder with default settings.
  pub fn new() -> Self {
    Self {
      shards: (num_cpus::get() * 4).max(1).next_power_of_two(),
      hasher: H::default(),
      loader: None,
      loader_conflict: false,
      loader_executor: None,
      refresh_executor: None,
      loader_thread_count: num_cpus::get().max(2),
      permit_null_values: false,
      expire_after_write: None,
      expiry_policy: None,
      refresh_ahead: false,
      refresh_ahead_window: None,
      keep_data_after_expired: false,
      resilience: ResilienceConfig::default(),
      resilience_policy: None,
      _key_marker: PhantomData,
      _value_marker: PhantomData,
    }
  }
}

impl<K, V> Default for CacheBuilder<K, V, ahash::RandomState> {
  fn default() -> Self {
    Self::new()
  }
}

// --- General configuration methods ---
impl<K, V, H> CacheBuilder<K, V, H> {
  /// Sets the number of concurrent shards to use. Rounded up to a power of
  /// two at build time.
  pub fn shards(mut self, shards: usize) -> Self {
    self.shards = shards;
    self
  }

  /// Sets a time-to-live measured from load completion for all entries.
  /// Without it, entries are eternal.
  pub fn expire_after_write(mut self, duration: Duration) -> Self {
    self.expire_after_write = Some(duration);
    self
  }

  /// Per-entry expiry override, computed at load completion. `None` means
  /// eternal; a zero duration means "do not cache this value".
  pub fn expiry_policy<F>(mut self, policy: F) -> Self
  where
    F: Fn(&K, Option<&V>, Instant) -> Option<Duration> + Send + Sync + 'static,
  {
    self.expiry_policy = Some(Arc::new(policy));
    self
  }

  /// Permits loaders to produce "no value" for a key: the entry is cached
  /// without a value and reads return `Ok(None)`. Disabled, a null result
  /// from a loader is a load failure.
  pub fn permit_null_values(mut self, permit: bool) -> Self {
    self.permit_null_values = permit;
    self
  }

  /// Keeps expired entries around so the loader sees the previous value as
  /// the current entry when reloading.
  pub fn keep_data_after_expired(mut self, keep: bool) -> Self {
    self.keep_data_after_expired = keep;
    self
  }

  /// Enables refresh-ahead: an access that finds an entry near or past its
  /// expiry keeps serving the current value and reloads in the background.
  pub fn refresh_ahead(mut self, enabled: bool) -> Self {
    self.refresh_ahead = enabled;
    self
  }

  /// Remaining-TTL threshold at or below which an access schedules the
  /// background refresh. Defaults to zero: refresh on expired access only.
  pub fn refresh_ahead_window(mut self, window: Duration) -> Self {
    self.refresh_ahead_window = Some(window);
    self
  }

  /// Sets the executor that `load_all`/`reload_all` offload sync loader
  /// work to. Defaults to a pool owned by the cache.
  pub fn loader_executor<E: Executor>(mut self, executor: E) -> Self {
    self.loader_executor = Some(Arc::new(executor));
    self
  }

  /// Sets the executor for refresh-ahead reloads. Defaults to the loader
  /// executor.
  pub fn refresh_executor<E: Executor>(mut self, executor: E) -> Self {
    self.refresh_executor = Some(Arc::new(executor));
    self
  }

  /// Thread count for the default loader pool. At least two threads are
  /// always kept so overlapping loads can progress independently.
  pub fn loader_thread_count(mut self, count: usize) -> Self {
    self.loader_thread_count = count;
    self
  }

  // --- Resilience knobs ---
  // Setting any of these enables the universal resilience policy; its
  // remaining parameters are derived at build time.

  /// Base interval before a failed load is retried. Grows exponentially
  /// with consecutive failures.
  pub fn retry_interval(mut self, interval: Duration) -> Self {
    self.resilience.enabled = true;
    self.resilience.retry_interval = Some(interval);
    self
  }

  /// Upper bound for the (growing) retry interval.
  pub fn max_retry_interval(mut self, interval: Duration) -> Self {
    self.resilience.enabled = true;
    self.resilience.max_retry_interval = Some(interval);
    self
  }

  /// How long a previously loaded value may keep being served while loads
  /// fail, measured from the first failure of the streak.
  pub fn resilience_duration(mut self, duration: Duration) -> Self {
    self.resilience.enabled = true;
    self.resilience.resilience_duration = Some(duration);
    self
  }

  /// Back-off multiplier applied per consecutive failure. Defaults to 1.5.
  pub fn resilience_multiplier(mut self, multiplier: f64) -> Self {
    self.resilience.enabled = true;
    self.resilience.multiplier = Some(multiplier);
    self
  }

  /// Randomization factor of the retry interval in `[0, 1]`. Defaults
  /// to 0.5.
  pub fn resilience_randomization(mut self, randomization: f64) -> Self {
    self.resilience.enabled = true;
    self.resilience.randomization = Some(randomization);
    self
  }

  /// Whether failures may be suppressed by serving the previous value.
  /// Defaults to true once resilience is enabled.
  pub fn suppress_exceptions(mut self, suppress: bool) -> Self {
    self.resilience.enabled = true;
    self.resilience.suppress_exceptions = Some(suppress);
    self
  }

  /// Installs a custom resilience policy instead of the universal one.
  pub fn resilience_policy<P: ResiliencePolicy>(mut self, policy: P) -> Self {
    self.resilience_policy = Some(Arc::new(policy));
    self
  }

  fn set_loader(&mut self, loader: Loader<K, V, H>) {
    if self.loader.is_some() {
      self.loader_conflict = true;
    }
    self.loader = Some(loader);
  }

  /// Sets the synchronous loader, called with the key on a miss.
  pub fn loader<F>(mut self, load: F) -> Self
  where
    F: Fn(&K) -> Result<Option<V>, BoxError> + Send + Sync + 'static,
  {
    self.set_loader(Loader::Sync(Arc::new(load)));
    self
  }

  /// Sets the advanced synchronous loader, which additionally receives the
  /// load start time and the current entry snapshot (absent for a fresh
  /// miss, or an expired entry without keep-data).
  pub fn advanced_loader<F>(mut self, load: F) -> Self
  where
    F: Fn(&K, Instant, Option<&EntrySnapshot<K, V>>) -> Result<Option<V>, BoxError>
      + Send
      + Sync
      + 'static,
  {
    self.set_loader(Loader::Advanced(Arc::new(load)));
    self
  }

  /// Sets the asynchronous loader. Invoked on the calling thread; completes
  /// through the callback, from any thread, exactly once. An `Err` return
  /// before the callback fired fails the load.
  pub fn async_loader<F>(mut self, load: F) -> Self
  where
    F: Fn(&K, &LoaderContext<K, V, H>, LoadCallback<K, V, H>) -> Result<(), BoxError>
      + Send
      + Sync
      + 'static,
  {
    self.set_loader(Loader::Async(Arc::new(load)));
    self
  }

  /// Sets the synchronous bulk loader. Receives the deduplicated group of
  /// keys that miss together; a key absent from the returned map fails.
  pub fn bulk_loader<F>(mut self, load: F) -> Self
  where
    F: Fn(&[K]) -> Result<HashMap<K, V>, BoxError> + Send + Sync + 'static,
  {
    self.set_loader(Loader::Bulk(Arc::new(load)));
    self
  }

  /// Sets the asynchronous bulk loader, completing per key or with one map
  /// through the bulk callback.
  pub fn async_bulk_loader<F>(mut self, load: F) -> Self
  where
    F: Fn(&[K], &BulkLoaderContext<K, V, H>, BulkCallback<K, V, H>) -> Result<(), BoxError>
      + Send
      + Sync
      + 'static,
  {
    self.set_loader(Loader::AsyncBulk(Arc::new(load)));
    self
  }
}

// --- Build ---
impl<K, V, H> CacheBuilder<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Sets the hasher for the slot map shards.
  pub fn hasher(mut self, hasher: H) -> Self {
    self.hasher = hasher;
    self
  }

  fn validate(&self) -> Result<(), BuildError> {
    if self.shards == 0 {
      return Err(BuildError::ZeroShards);
    }
    if self.loader_thread_count == 0 {
      return Err(BuildError::ZeroLoaderThreads);
    }
    if self.loader_conflict {
      return Err(BuildError::MultipleLoaders);
    }
    if self.refresh_ahead && self.loader.is_none() {
      return Err(BuildError::RefreshWithoutLoader);
    }
    if self.resilience.resilience_duration.is_some()
      && self.resilience.suppress_exceptions == Some(false)
    {
      return Err(BuildError::SuppressionDisabledWithDuration);
    }
    Ok(())
  }

  /// Builds the cache.
  pub fn build(mut self) -> Result<Cache<K, V, H>, BuildError> {
    self.validate()?;

    let mut owned_pool = None;
    let loader_executor: Arc<dyn Executor> = match self.loader_executor.take() {
      Some(executor) => executor,
      None if self.loader.is_some() => {
        let pool = Arc::new(ThreadPool::new(
          self.loader_thread_count.max(2),
          "lodestone-loader",
        ));
        owned_pool = Some(pool.clone());
        pool
      }
      None => COMMON_EXECUTOR.clone(),
    };
    let refresh_executor = self
      .refresh_executor
      .take()
      .unwrap_or_else(|| loader_executor.clone());

    let resilience: Option<Arc<dyn ResiliencePolicy>> = match self.resilience_policy.take() {
      Some(policy) => Some(policy),
      None if self.resilience.enabled => {
        let policy =
          UniversalResiliencePolicy::from_config(&self.resilience, self.expire_after_write);
        if policy.is_noop() {
          None
        } else {
          Some(Arc::new(policy))
        }
      }
      None => None,
    };

    let store = ShardedStore::new(self.shards, self.hasher.clone());
    Ok(Cache::from_shared(Arc::new(CacheShared {
      store,
      metrics: Metrics::new(),
      loader: self.loader.take(),
      loader_executor,
      refresh_executor,
      common_executor: COMMON_EXECUTOR.clone(),
      owned_pool,
      resilience,
      expire_after_write: self.expire_after_write,
      expiry_policy: self.expiry_policy.take(),
      permit_null_values: self.permit_null_values,
      keep_data_after_expired: self.keep_data_after_expired,
      refresh_ahead: self.refresh_ahead,
      refresh_ahead_window: self
        .refresh_ahead_window
        .map(time::duration_to_nanos)
        .unwrap_or(0),
      closed: AtomicBool::new(false),
    })))
  }
}
