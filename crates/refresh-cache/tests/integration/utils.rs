use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use refresh_cache::{CacheOutcome, ManualClock, Observer, RefreshCache};

pub use refresh_cache_test::{Calls, Gate, secs, setup, yield_until};

/// Creates a cache driven by a [`ManualClock`], which is returned alongside.
///
/// The clock starts at "t = 0" and only moves when the test advances it.
pub fn manual_cache<K, V>(
    refetch_before_expiry: Option<Duration>,
    max_entries: usize,
) -> (RefreshCache<K, V>, ManualClock)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    setup();

    let clock = ManualClock::new();
    let mut builder = RefreshCache::builder()
        .name("test")
        .clock(clock.clone())
        .max_entries(max_entries);
    if let Some(margin) = refetch_before_expiry {
        builder = builder.refetch_before_expiry(margin);
    }

    (builder.build(), clock)
}

/// Records the outcomes reported to its observers, in order.
#[derive(Clone, Debug, Default)]
pub struct Outcomes(Arc<Mutex<Vec<CacheOutcome>>>);

impl Outcomes {
    pub fn observer<V: 'static>(&self) -> Observer<V> {
        let seen = Arc::clone(&self.0);
        Observer::new(move |_: Option<&V>, outcome| seen.lock().unwrap().push(outcome))
    }

    /// Returns the outcomes recorded so far and clears them.
    pub fn take(&self) -> Vec<CacheOutcome> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// The cached keys, sorted.
pub fn sorted_keys<K: Ord, V>(cache: &RefreshCache<K, V>) -> Vec<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut keys = cache.keys();
    keys.sort();
    keys
}
