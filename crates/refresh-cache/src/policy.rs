//! Deciding when a cached value is served, refreshed, or refetched.

use std::fmt;
use std::time::{Duration, Instant};

use crate::store::CacheEntry;

/// Stand-in for "forever", roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The state of a cached entry relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The value can be served as-is.
    Fresh,
    /// The value can still be served, but a background refresh should be started.
    StaleButValid,
    /// The value must not be served anymore; callers have to wait for a new one.
    HardExpired,
    /// There is no value for the key.
    Absent,
}

impl Freshness {
    /// Classifies `entry` at the instant `now`.
    pub fn of<V>(entry: Option<&CacheEntry<V>>, now: Instant) -> Self {
        let Some(entry) = entry else {
            return Self::Absent;
        };

        if now >= entry.expiry() {
            Self::HardExpired
        } else if entry.refresh_at().is_some_and(|refresh_at| now >= refresh_at) {
            Self::StaleButValid
        } else {
            Self::Fresh
        }
    }
}

/// Explicit refresh-ahead timings for a freshly fetched value, relative to the fetch start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// After this, the value is still served but triggers a background refresh.
    pub refresh_after: Duration,
    /// After this, the value is not served anymore.
    pub expire_after: Duration,
}

impl Schedule {
    pub fn new(refresh_after: Duration, expire_after: Duration) -> Self {
        Self {
            refresh_after,
            expire_after,
        }
    }
}

/// The absolute deadlines computed for a fetched value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deadlines {
    pub expiry: Instant,
    pub refresh_at: Option<Instant>,
}

enum LifetimeKind<V> {
    Unbounded,
    Fixed(Duration),
    PerValue(Box<dyn FnOnce(&V) -> Duration + Send>),
    Scheduled(Box<dyn FnOnce(&V) -> Schedule + Send>),
}

/// How long a freshly fetched value stays in the cache.
///
/// The lifetime is evaluated once per successful fetch, with the value that was just produced.
/// This allows deriving the lifetime from the value itself, for example from the expiry claim of
/// an access token.
///
/// For [`unbounded`](Self::unbounded), [`fixed`](Self::fixed) and [`per_value`](Self::per_value)
/// lifetimes, the cache's `refetch_before_expiry` margin decides when a background refresh
/// kicks in. A [`scheduled`](Self::scheduled) lifetime brings its own refresh point instead.
pub struct Lifetime<V> {
    kind: LifetimeKind<V>,
}

impl<V> Lifetime<V> {
    /// The value never expires on its own.
    pub fn unbounded() -> Self {
        Self {
            kind: LifetimeKind::Unbounded,
        }
    }

    /// The value expires a fixed duration after its fetch started.
    pub fn fixed(lifetime: Duration) -> Self {
        Self {
            kind: LifetimeKind::Fixed(lifetime),
        }
    }

    /// The lifetime is computed from the fetched value.
    pub fn per_value<F>(f: F) -> Self
    where
        F: FnOnce(&V) -> Duration + Send + 'static,
    {
        Self {
            kind: LifetimeKind::PerValue(Box::new(f)),
        }
    }

    /// Refresh and expiry are both computed from the fetched value.
    pub fn scheduled<F>(f: F) -> Self
    where
        F: FnOnce(&V) -> Schedule + Send + 'static,
    {
        Self {
            kind: LifetimeKind::Scheduled(Box::new(f)),
        }
    }

    /// Computes the deadlines of `value`, whose fetch started at `start`.
    pub(crate) fn resolve(self, value: &V, start: Instant, margin: Option<Duration>) -> Deadlines {
        let lifetime = match self.kind {
            LifetimeKind::Unbounded => {
                return Deadlines {
                    expiry: saturating_add(start, FAR_FUTURE),
                    refresh_at: None,
                };
            }
            LifetimeKind::Scheduled(f) => {
                let schedule = f(value);
                let expiry = saturating_add(start, schedule.expire_after);
                let refresh_at = saturating_add(start, schedule.refresh_after).min(expiry);
                return Deadlines {
                    expiry,
                    refresh_at: Some(refresh_at),
                };
            }
            LifetimeKind::Fixed(lifetime) => lifetime,
            LifetimeKind::PerValue(f) => f(value),
        };

        let expiry = saturating_add(start, lifetime);
        // A margin larger than the lifetime makes the value stale right away.
        let refresh_at = margin.map(|margin| {
            expiry
                .checked_sub(margin)
                .map_or(start, |refresh_at| refresh_at.max(start))
        });

        Deadlines { expiry, refresh_at }
    }
}

impl<V> Default for Lifetime<V> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<V> From<Duration> for Lifetime<V> {
    fn from(lifetime: Duration) -> Self {
        Self::fixed(lifetime)
    }
}

impl<V> From<Option<Duration>> for Lifetime<V> {
    fn from(lifetime: Option<Duration>) -> Self {
        lifetime.map_or_else(Self::unbounded, Self::fixed)
    }
}

impl<V> fmt::Debug for Lifetime<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            LifetimeKind::Unbounded => f.write_str("Unbounded"),
            LifetimeKind::Fixed(lifetime) => f.debug_tuple("Fixed").field(lifetime).finish(),
            LifetimeKind::PerValue(_) => f.write_str("PerValue"),
            LifetimeKind::Scheduled(_) => f.write_str("Scheduled"),
        }
    }
}

fn saturating_add(start: Instant, duration: Duration) -> Instant {
    start
        .checked_add(duration)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}
