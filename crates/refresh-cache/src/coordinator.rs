//! Request coalescing for value fetches.
//!
//! The coordinator makes sure that for every key, at most one fetch is running at any time.
//! Everybody asking for a fresh value while a fetch is running joins that fetch and observes its
//! outcome.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

use crate::error::CacheError;
use crate::slots::{self, SlotSelector};

/// A fetch that can be awaited by any number of callers.
pub(crate) type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

struct InFlight<V> {
    /// Distinguishes this fetch from later fetches of the same key.
    id: u64,
    fetch: SharedFetch<V>,
}

type Registry<K, V> = FxHashMap<K, InFlight<V>>;

/// The registry of currently running fetches, split into a fixed number of lock slots.
///
/// Holding the lock of a slot gives mutual exclusion for all keys mapping into that slot. The
/// number of slots is fixed, so keys that happen to share a slot contend with each other.
pub(crate) struct FetchCoordinator<K, V> {
    selector: SlotSelector,
    slots: Box<[Mutex<Registry<K, V>>]>,
    next_id: AtomicU64,
}

/// The locked registry slot of a key.
pub(crate) struct SlotGuard<'a, K, V> {
    registry: MutexGuard<'a, Registry<K, V>>,
}

impl<K, V> SlotGuard<'_, K, V>
where
    K: Eq + Hash,
{
    /// Returns the fetch currently running for `key`, if any.
    pub fn in_flight(&self, key: &K) -> Option<SharedFetch<V>> {
        self.registry.get(key).map(|in_flight| in_flight.fetch.clone())
    }
}

/// Removes the registration of a fetch when dropped.
///
/// This is created when the task driving the fetch first runs. It is dropped once the fetch has
/// committed its value, or while unwinding from a panicking fetch.
struct Registration<K: Eq + Hash, V> {
    coordinator: Weak<FetchCoordinator<K, V>>,
    key: K,
    id: u64,
}

impl<K: Eq + Hash, V> Drop for Registration<K, V> {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.finish(&self.key, self.id);
        }
    }
}

impl<K: Eq + Hash, V> FetchCoordinator<K, V> {
    pub fn new(slots: usize) -> Self {
        let selector = SlotSelector::new(slots);
        let slots = (0..selector.len()).map(|_| Default::default()).collect();
        Self {
            selector,
            slots,
            next_id: AtomicU64::new(0),
        }
    }

    /// Locks the registry slot responsible for `key`.
    ///
    /// The guard must not be held across an `.await`.
    pub fn lock(&self, key: &K) -> SlotGuard<'_, K, V> {
        let registry = slots::lock(&self.slots[self.selector.slot_for(key)]);
        SlotGuard { registry }
    }

    /// Removes the registration of fetch `id` for `key`, unless a newer fetch replaced it.
    fn finish(&self, key: &K, id: u64) {
        let mut guard = self.lock(key);
        if guard.registry.get(key).is_some_and(|in_flight| in_flight.id == id) {
            guard.registry.remove(key);
        }
    }

    /// The number of fetches currently running.
    pub fn len(&self) -> usize {
        self.slots.iter().map(|slot| slots::lock(slot).len()).sum()
    }
}

impl<K, V> FetchCoordinator<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Joins the fetch running for `key`, or starts a new one with `start`.
    ///
    /// This consumes the slot `guard`. A new fetch is registered while the slot is locked, and
    /// `start` is only invoked after the lock is released, so it may use the cache itself. The
    /// future it returns is driven on a spawned task, so it keeps running even if every caller
    /// stops waiting for it. Once that future resolves, the registration is removed before the
    /// result is handed to any waiter.
    ///
    /// Returns the fetch and whether it was started by this call.
    pub fn get_or_start<F, Fut>(
        self: &Arc<Self>,
        mut guard: SlotGuard<'_, K, V>,
        key: &K,
        start: F,
    ) -> (SharedFetch<V>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CacheError>> + Send + 'static,
    {
        if let Some(fetch) = guard.in_flight(key) {
            return (fetch, false);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel::<Fut>();

        let handle = tokio::spawn({
            let coordinator = Arc::downgrade(self);
            let key = key.clone();
            async move {
                let _registration = Registration {
                    coordinator,
                    key,
                    id,
                };
                match receiver.await {
                    Ok(fetch) => fetch.await,
                    // `start` panicked before handing over its future.
                    Err(_) => Err(CacheError::Aborted),
                }
            }
        });

        let coordinator = Arc::downgrade(self);
        let key_on_abort = key.clone();
        let fetch = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "Value fetch task aborted"
                    );
                    // A task that never ran did not register its cleanup.
                    if let Some(coordinator) = coordinator.upgrade() {
                        coordinator.finish(&key_on_abort, id);
                    }
                    Err(CacheError::Aborted)
                }
            }
        }
        .boxed()
        .shared();

        guard.registry.insert(
            key.clone(),
            InFlight {
                id,
                fetch: fetch.clone(),
            },
        );
        drop(guard);

        // The task is only gone if the runtime is shutting down, and then nobody gets a result.
        let _ = sender.send(start());

        (fetch, true)
    }
}
