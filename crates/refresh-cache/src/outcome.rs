use std::fmt;
use std::sync::Arc;

/// How a cache lookup was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOutcome {
    /// The value was cached and fresh, and returned as-is.
    Cached,
    /// The value was cached but due for a refresh.
    ///
    /// It was returned as-is, and a background refresh was started or already running.
    Refreshed,
    /// The value was cached but had expired, so a new one was fetched.
    Expired,
    /// There was no cached value, so a new one was fetched.
    New,
    /// Fetching a value failed.
    Error,
}

impl AsRef<str> for CacheOutcome {
    fn as_ref(&self) -> &str {
        match self {
            Self::Cached => "cached",
            Self::Refreshed => "refreshed",
            Self::Expired => "expired",
            Self::New => "new",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

type Callback<V> = dyn Fn(Option<&V>, CacheOutcome) + Send + Sync;

/// An optional callback that is told the [`CacheOutcome`] of lookups, e.g. for metrics.
///
/// The callback receives the value that was returned, or `None` for [`CacheOutcome::Error`].
/// Failures of background refreshes are only visible through this callback, since the caller
/// that started them has already received the previous value.
pub struct Observer<V> {
    callback: Option<Arc<Callback<V>>>,
}

impl<V> Observer<V> {
    /// An observer that does nothing.
    pub fn none() -> Self {
        Self { callback: None }
    }

    /// An observer calling `callback` for every outcome.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Option<&V>, CacheOutcome) + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    pub(crate) fn notify(&self, value: Option<&V>, outcome: CacheOutcome) {
        if let Some(callback) = &self.callback {
            callback(value, outcome);
        }
    }
}

impl<V> Default for Observer<V> {
    fn default() -> Self {
        Self::none()
    }
}

impl<V> Clone for Observer<V> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
        }
    }
}

impl<V> fmt::Debug for Observer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("active", &self.callback.is_some())
            .finish()
    }
}
