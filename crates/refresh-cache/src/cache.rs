use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::clock::{Clock, SharedClock};
use crate::config::CacheConfig;
use crate::coordinator::FetchCoordinator;
use crate::error::CacheError;
use crate::eviction::EvictionPolicy;
use crate::outcome::{CacheOutcome, Observer};
use crate::policy::{Deadlines, Freshness, Lifetime, Schedule};
use crate::store::{CacheEntry, ValueStore};

/// An in-memory cache for values that are expensive to fetch.
///
/// Concurrent lookups of a key that needs a new value are coalesced into a single invocation of
/// the value factory, and all of them observe the outcome of that invocation.
///
/// Values have a hard expiry, after which they are not served anymore. When the cache is
/// configured with a [`refetch_before_expiry`](CacheConfig::refetch_before_expiry) margin (or
/// when a lookup uses [`get_or_refresh`](Self::get_or_refresh)), a value that is about to expire
/// is still served, while a replacement is fetched in the background.
///
/// Cloning the cache is cheap and gives another handle to the same values.
pub struct RefreshCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

struct Inner<K, V> {
    config: CacheConfig,
    clock: SharedClock,
    store: ValueStore<K, V>,
    coordinator: Arc<FetchCoordinator<K, V>>,
    eviction: EvictionPolicy,
}

impl<K, V> Clone for RefreshCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> fmt::Debug for RefreshCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCache")
            .field("config", &self.inner.config)
            .field("entries", &self.len())
            .field("running fetches", &self.in_flight())
            .finish()
    }
}

/// Builds a [`RefreshCache`].
pub struct RefreshCacheBuilder<K, V> {
    clock: SharedClock,
    config: CacheConfig,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Default for RefreshCacheBuilder<K, V> {
    fn default() -> Self {
        Self {
            clock: SharedClock::default(),
            config: CacheConfig::default(),
            _types: PhantomData,
        }
    }
}

impl<K, V> fmt::Debug for RefreshCacheBuilder<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCacheBuilder")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish()
    }
}

impl<K, V> RefreshCacheBuilder<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Uses `clock` as the time source. Defaults to [`SystemClock`](crate::SystemClock).
    pub fn clock<C: Clock>(mut self, clock: C) -> Self {
        self.clock = SharedClock::new(clock);
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn refetch_before_expiry(mut self, margin: Duration) -> Self {
        self.config.refetch_before_expiry = Some(margin);
        self
    }

    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.config.max_entries = max_entries;
        self
    }

    pub fn lock_slots(mut self, lock_slots: usize) -> Self {
        self.config.lock_slots = lock_slots;
        self
    }

    pub fn build(self) -> RefreshCache<K, V> {
        let Self { clock, config, .. } = self;
        let inner = Inner {
            store: ValueStore::new(clock.now()),
            clock,
            coordinator: Arc::new(FetchCoordinator::new(config.lock_slots)),
            eviction: EvictionPolicy::new(config.max_entries),
            config,
        };
        RefreshCache {
            inner: Arc::new(inner),
        }
    }
}

impl<K, V> RefreshCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a new cache using `clock` as its time source.
    pub fn new<C: Clock>(clock: C, config: CacheConfig) -> Self {
        Self::builder().clock(clock).config(config).build()
    }

    pub fn builder() -> RefreshCacheBuilder<K, V> {
        RefreshCacheBuilder::default()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Returns the value for `key`, fetching it with `factory` if needed.
    ///
    /// - A fresh value is returned right away.
    /// - A value that is due for a refresh is returned right away as well, and a background
    ///   refresh is started unless one is already running.
    /// - If there is no value, or it has expired, this waits for a fetch. If a fetch is already
    ///   running for `key`, this joins it instead of starting another one.
    ///
    /// The factory is not retried. Its error is returned to every caller that waited for the
    /// failed fetch, and the next lookup starts a new fetch.
    ///
    /// `factory` is called synchronously when a fetch starts, without holding any lock of the
    /// cache. The future it returns is driven on a spawned tokio task. This must therefore be
    /// called from within a tokio runtime.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: K,
        factory: F,
        lifetime: impl Into<Lifetime<V>>,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.lookup(key, factory, lifetime.into(), &Observer::none())
            .await
    }

    /// Like [`get_or_create`](Self::get_or_create), but reports the outcome to `observer`.
    pub async fn get_or_create_observed<F, Fut>(
        &self,
        key: K,
        factory: F,
        lifetime: impl Into<Lifetime<V>>,
        observer: &Observer<V>,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.lookup(key, factory, lifetime.into(), observer).await
    }

    /// Like [`get_or_create`](Self::get_or_create), with refresh and expiry both derived from
    /// the fetched value.
    pub async fn get_or_refresh<F, Fut, S>(
        &self,
        key: K,
        factory: F,
        schedule: S,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
        S: FnOnce(&V) -> Schedule + Send + 'static,
    {
        self.lookup(key, factory, Lifetime::scheduled(schedule), &Observer::none())
            .await
    }

    /// Like [`get_or_refresh`](Self::get_or_refresh), but reports the outcome to `observer`.
    pub async fn get_or_refresh_observed<F, Fut, S>(
        &self,
        key: K,
        factory: F,
        schedule: S,
        observer: &Observer<V>,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
        S: FnOnce(&V) -> Schedule + Send + 'static,
    {
        self.lookup(key, factory, Lifetime::scheduled(schedule), observer)
            .await
    }

    async fn lookup<F, Fut>(
        &self,
        key: K,
        factory: F,
        lifetime: Lifetime<V>,
        observer: &Observer<V>,
    ) -> Result<V, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let inner = &self.inner;
        let name = inner.config.name.as_str();
        metric!(counter("caches.access") += 1, "cache" => name);

        let now = inner.clock.now();

        // Fast path, without touching the coordinator.
        if let Some(entry) = inner.store.read(&key) {
            if Freshness::of(Some(&*entry), now) == Freshness::Fresh {
                inner.report(observer, Some(entry.value()), CacheOutcome::Cached);
                return Ok(entry.value().clone());
            }
        }

        let (fetch, outcome) = {
            let guard = inner.coordinator.lock(&key);

            // A fetch that settled since the read above has committed its value before giving
            // up its registration, so looking again under the lock cannot miss it.
            let entry = inner.store.read(&key);
            let outcome = match (Freshness::of(entry.as_deref(), now), entry) {
                (Freshness::Fresh, Some(entry)) => {
                    inner.report(observer, Some(entry.value()), CacheOutcome::Cached);
                    return Ok(entry.value().clone());
                }
                (Freshness::StaleButValid, Some(entry)) => {
                    let (_, started) = inner.coordinator.get_or_start(guard, &key, || {
                        inner.fetch(key.clone(), factory, lifetime, now, Some(observer.clone()))
                    });
                    if started {
                        tracing::debug!(cache = name, "Refreshing value in the background");
                    }
                    inner.report(observer, Some(entry.value()), CacheOutcome::Refreshed);
                    return Ok(entry.value().clone());
                }
                (Freshness::HardExpired, _) => CacheOutcome::Expired,
                _ => CacheOutcome::New,
            };

            let (fetch, started) = inner.coordinator.get_or_start(guard, &key, || {
                inner.fetch(key.clone(), factory, lifetime, now, None)
            });
            tracing::trace!(cache = name, started, %outcome, "Waiting for value fetch");
            (fetch, outcome)
        };

        match fetch.await {
            Ok(value) => {
                inner.report(observer, Some(&value), outcome);
                Ok(value)
            }
            Err(err) => {
                inner.report(observer, None, CacheOutcome::Error);
                Err(err)
            }
        }
    }

    /// The number of cached values.
    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of all cached keys.
    pub fn keys(&self) -> Vec<K> {
        self.inner
            .store
            .snapshot()
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    /// A snapshot of all cached entries.
    pub fn values(&self) -> Vec<Arc<CacheEntry<V>>> {
        self.inner
            .store
            .snapshot()
            .into_iter()
            .map(|(_, entry)| entry)
            .collect()
    }

    /// The number of fetches that are currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.coordinator.len()
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Reports an outcome to the observer and to metrics.
    fn report(&self, observer: &Observer<V>, value: Option<&V>, outcome: CacheOutcome) {
        metric!(
            counter("caches.outcome") += 1,
            "cache" => self.config.name.as_str(),
            "outcome" => outcome.as_ref(),
        );
        observer.notify(value, outcome);
    }

    /// Creates the future that fetches a value for `key` and commits it.
    ///
    /// The `background` observer is given for fetches nobody waits for. It is the only place
    /// their failure is reported to.
    fn fetch<F, Fut>(
        self: &Arc<Self>,
        key: K,
        factory: F,
        lifetime: Lifetime<V>,
        started: Instant,
        background: Option<Observer<V>>,
    ) -> BoxFuture<'static, Result<V, CacheError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let inner = Arc::clone(self);
        let value = factory();

        async move {
            let fetch_start = Instant::now();
            let result = match AssertUnwindSafe(value).catch_unwind().await {
                Ok(result) => result.map_err(CacheError::from),
                Err(_) => {
                    tracing::error!(cache = inner.config.name.as_str(), "Value factory panicked");
                    Err(CacheError::Aborted)
                }
            };
            metric!(
                timer("caches.fetch.duration") = fetch_start.elapsed(),
                "cache" => inner.config.name.as_str(),
                "status" => if result.is_ok() { "ok" } else { "err" },
            );

            match result {
                Ok(value) => {
                    let margin = inner.config.refetch_before_expiry;
                    let deadlines = lifetime.resolve(&value, started, margin);
                    inner.commit(key, value.clone(), deadlines);
                    Ok(value)
                }
                Err(err) => {
                    if let Some(observer) = background {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            cache = inner.config.name.as_str(),
                            "Background refresh failed"
                        );
                        inner.report(&observer, None, CacheOutcome::Error);
                    }
                    Err(err)
                }
            }
        }
        .boxed()
    }

    /// Stores a freshly fetched value and evicts what no longer fits.
    fn commit(&self, key: K, value: V, deadlines: Deadlines) {
        let name = self.config.name.as_str();
        let now = self.clock.now();

        let expired = self.eviction.prune_expired(&self.store, now);
        let entry = self.store.entry(value, deadlines.expiry, deadlines.refresh_at);
        self.store.write(key, entry);
        let evicted = self.eviction.enforce_capacity(&self.store);

        if expired > 0 {
            metric!(
                counter("caches.evicted") += expired as i64,
                "cache" => name,
                "reason" => "expired",
            );
        }
        if evicted > 0 {
            metric!(
                counter("caches.evicted") += evicted as i64,
                "cache" => name,
                "reason" => "capacity",
            );
        }
        if expired > 0 || evicted > 0 {
            tracing::debug!(cache = name, expired, evicted, "Evicted cache entries");
        }

        let entries = self.store.len();
        metric!(gauge("caches.entries") = entries as u64, "cache" => name);
        tracing::debug!(cache = name, entries, "Committed fetched value");
    }
}
