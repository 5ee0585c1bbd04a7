//! A concurrent in-process loading cache.
//!
//! On a miss the cache runs a user-supplied loader, stores the result, and
//! hands it to every caller that asked for the key while the load was in
//! flight: at most one load runs per key at any time. Loaders come in five
//! shapes (sync, sync with entry context, callback-async, and sync/async
//! bulk), failures are routed through a resilience policy that can serve
//! stale values and back off retries, and near-expiry accesses can trigger
//! non-blocking refresh-ahead reloads.
//!
//! ```
//! use lodestone::CacheBuilder;
//!
//! let cache = CacheBuilder::default()
//!   .loader(|key: &i32| Ok(Some(key * 2)))
//!   .build()
//!   .unwrap();
//!
//! let value = cache.get(&21).unwrap();
//! assert_eq!(*value.unwrap(), 42);
//! ```

mod builder;
mod bulk;
mod completion;
mod dispatch;
mod entry;
mod error;
mod handles;
mod loader;
mod metrics;
mod processor;
mod record;
mod resilience;
mod rng;
mod runtime;
mod shared;
mod store;
mod time;

pub use builder::CacheBuilder;
pub use bulk::{BulkCallback, BulkLoaderContext};
pub use completion::CompletionFuture;
pub use entry::{EntrySnapshot, ExceptionInfo};
pub use error::{
  BoxError, BuildError, CacheError, CallbackError, LoaderError, NullValueError,
  PartialResultError, ProcessingError, SharedError,
};
pub use handles::Cache;
pub use loader::{LoadCallback, LoaderContext};
pub use metrics::MetricsSnapshot;
pub use processor::{EntryProcessor, ProcessingResult};
pub use resilience::{ResiliencePolicy, UniversalResiliencePolicy};
pub use runtime::{Executor, Task, ThreadPool};
