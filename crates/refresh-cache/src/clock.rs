//! Time sources for the cache.
//!
//! All expiry decisions go through a [`Clock`], so that tests can drive time explicitly instead
//! of sleeping.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A monotonic source of "now".
pub trait Clock: Send + Sync + 'static {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// The process-wide monotonic clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that follows the tokio timer.
///
/// This behaves like [`SystemClock`] in production, but honors [`tokio::time::pause`] and
/// [`tokio::time::advance`] inside paused test runtimes.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can hand one clone to the cache and keep
/// another one around to [`advance`](Self::advance) it.
///
/// Not meant for production use.
#[derive(Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<std::sync::Mutex<Duration>>,
}

impl ManualClock {
    /// Creates a new clock frozen at an arbitrary origin.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Default::default(),
        }
    }

    /// The instant this clock started at, which is "t = 0" for tests.
    pub fn origin(&self) -> Instant {
        self.origin
    }

    /// How far the clock has been advanced since its origin.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner()) += duration;
    }

    /// Moves the clock to `origin + offset`. Moving backwards is ignored.
    pub fn set(&self, offset: Duration) {
        let mut current = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *current = (*current).max(offset);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

/// Type-erased clock handle stored inside the cache.
#[derive(Clone)]
pub(crate) struct SharedClock(Arc<dyn Clock>);

impl SharedClock {
    pub fn new<C: Clock>(clock: C) -> Self {
        Self(Arc::new(clock))
    }

    pub fn now(&self) -> Instant {
        self.0.now()
    }
}

impl fmt::Debug for SharedClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedClock")
    }
}

impl Default for SharedClock {
    fn default() -> Self {
        Self::new(SystemClock)
    }
}
