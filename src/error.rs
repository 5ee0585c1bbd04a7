use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Boxed error type accepted from loaders.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Shared form of a loader error. The same instance is handed to every waiter
/// of a load and kept in the entry for later re-raising.
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

/// Errors that can occur when building a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  /// The cache was configured with zero shards, which is not allowed.
  ZeroShards,
  /// The default loader pool needs at least one thread. The effective
  /// minimum is two; a configured count of one is rounded up.
  ZeroLoaderThreads,
  /// More than one loader shape was configured. The five shapes are
  /// mutually exclusive.
  MultipleLoaders,
  /// Refresh-ahead was enabled without any loader to refresh with.
  RefreshWithoutLoader,
  /// A resilience duration was set while exception suppression is disabled.
  SuppressionDisabledWithDuration,
}

impl fmt::Display for BuildError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildError::ZeroShards => write!(f, "shard count cannot be zero"),
      BuildError::ZeroLoaderThreads => write!(f, "loader thread count cannot be zero"),
      BuildError::MultipleLoaders => write!(f, "only one loader shape may be configured"),
      BuildError::RefreshWithoutLoader => {
        write!(f, "refresh ahead requires a loader")
      }
      BuildError::SuppressionDisabledWithDuration => write!(
        f,
        "exception suppression disabled but resilience duration set"
      ),
    }
  }
}

impl Error for BuildError {}

/// The envelope wrapped around everything a loader throws.
///
/// The original error stays reachable through [`LoaderError::cause`] (and
/// [`Error::source`]), so callers can downcast to their own error types.
/// For aggregated multi-key failures the message carries the failed count,
/// either as `"<n> loader exceptions"` or `"<n> out of <m> loads failed"`.
#[derive(Debug, Clone)]
pub struct LoaderError {
  message: String,
  cause: Option<SharedError>,
}

impl LoaderError {
  pub(crate) fn from_cause(cause: SharedError) -> Self {
    LoaderError {
      message: format!("loader exception: {}", cause),
      cause: Some(cause),
    }
  }

  /// Builds the aggregate envelope for a multi-key operation. `total` is
  /// given when the operation forced a load per key and the proportion is
  /// meaningful.
  pub(crate) fn aggregate(mut errors: Vec<LoaderError>, total: Option<usize>) -> Self {
    debug_assert!(!errors.is_empty());
    if errors.len() == 1 && total.is_none() {
      return errors.swap_remove(0);
    }
    let message = match total {
      Some(m) => format!("{} out of {} loads failed", errors.len(), m),
      None => format!("{} loader exceptions", errors.len()),
    };
    let cause = errors.into_iter().find_map(|e| e.cause);
    LoaderError { message, cause }
  }

  /// The original error raised by the loader, if any.
  pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
    self.cause.as_deref()
  }
}

impl fmt::Display for LoaderError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.message)
  }
}

impl Error for LoaderError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    self.cause.as_ref().map(|c| &**c as &(dyn Error + 'static))
  }
}

/// Errors surfaced by cache operations.
#[derive(Debug, Clone)]
pub enum CacheError {
  /// The cache was closed. New loading calls observe this; callbacks of
  /// loads that were already in flight are absorbed silently instead.
  Closed,
  /// A loader failure, wrapped in the [`LoaderError`] envelope.
  Loader(LoaderError),
  /// A loader context was asked for the current entry outside of the
  /// active load span.
  ContextAccessOutsideLoad,
}

impl CacheError {
  pub fn is_loader_error(&self) -> bool {
    matches!(self, CacheError::Loader(_))
  }

  /// The underlying loader error, if this is one.
  pub fn loader_error(&self) -> Option<&LoaderError> {
    match self {
      CacheError::Loader(e) => Some(e),
      _ => None,
    }
  }
}

impl fmt::Display for CacheError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CacheError::Closed => write!(f, "cache is closed"),
      CacheError::Loader(e) => e.fmt(f),
      CacheError::ContextAccessOutsideLoad => {
        write!(f, "current entry accessed outside the load operation")
      }
    }
  }
}

impl Error for CacheError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    match self {
      CacheError::Loader(e) => e.source(),
      _ => None,
    }
  }
}

impl From<LoaderError> for CacheError {
  fn from(e: LoaderError) -> Self {
    CacheError::Loader(e)
  }
}

/// Returned when an async load callback is completed a second time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
  /// The load was already completed through this callback.
  AlreadyCompleted,
  /// A bulk callback was given a key that does not belong to the request.
  UnknownKey,
}

impl fmt::Display for CallbackError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CallbackError::AlreadyCompleted => write!(f, "load callback already completed"),
      CallbackError::UnknownKey => write!(f, "key is not part of this bulk request"),
    }
  }
}

impl Error for CallbackError {}

/// Marker cause used when a loader produced no value while the cache does
/// not permit null values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NullValueError;

impl fmt::Display for NullValueError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "loader returned no value")
  }
}

impl Error for NullValueError {}

/// Marker cause used when a bulk loader completed with a partial result
/// that left a requested key uncovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialResultError;

impl fmt::Display for PartialResultError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "partial bulk result, key missing")
  }
}

impl Error for PartialResultError {}

/// Per-key failure produced by an entry processor run through
/// [`invoke_all`](crate::Cache::invoke_all).
#[derive(Debug, Clone)]
pub struct ProcessingError {
  cause: SharedError,
}

impl ProcessingError {
  pub(crate) fn new(cause: SharedError) -> Self {
    ProcessingError { cause }
  }

  pub fn cause(&self) -> &(dyn Error + Send + Sync + 'static) {
    &*self.cause
  }
}

impl fmt::Display for ProcessingError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "entry processing failed: {}", self.cause)
  }
}

impl Error for ProcessingError {
  fn source(&self) -> Option<&(dyn Error + 'static)> {
    Some(&*self.cause as &(dyn Error + 'static))
  }
}
