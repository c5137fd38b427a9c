use std::sync::Arc;

use thiserror::Error;

/// An error produced while fetching a value for the cache.
///
/// One fetch can be awaited by many callers at once, so the error is cheaply cloneable and every
/// joined caller receives the same instance.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The value factory returned an error.
    ///
    /// The original error can be inspected through [`CacheError::factory_error`].
    #[error("value factory failed: {0:#}")]
    Factory(Arc<anyhow::Error>),
    /// The fetch task panicked or was cancelled before producing a value.
    #[error("value fetch aborted")]
    Aborted,
}

impl CacheError {
    /// Returns the error raised by the value factory, if that is what failed.
    pub fn factory_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Factory(err) => Some(err),
            Self::Aborted => None,
        }
    }

    /// Returns `true` if both errors originate from the same failed fetch.
    pub fn same_fetch(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Factory(a), Self::Factory(b)) => Arc::ptr_eq(a, b),
            (Self::Aborted, Self::Aborted) => true,
            _ => false,
        }
    }
}

impl From<anyhow::Error> for CacheError {
    fn from(err: anyhow::Error) -> Self {
        Self::Factory(Arc::new(err))
    }
}
