//! The committed values of the cache.

use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

/// A committed cache value together with its expiry metadata.
///
/// Entries are never mutated: a refresh replaces the whole entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    value: V,
    expiry: Instant,
    refresh_at: Option<Instant>,
    /// Insertion order, used to break ties between equal expiries.
    seq: u64,
}

impl<V> CacheEntry<V> {
    /// The cached value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// The instant after which this value must not be served anymore.
    pub fn expiry(&self) -> Instant {
        self.expiry
    }

    /// The instant at which a background refresh is triggered, if refresh-ahead is enabled.
    ///
    /// This is never later than [`expiry`](Self::expiry).
    pub fn refresh_at(&self) -> Option<Instant> {
        self.refresh_at
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }
}

/// A concurrent map from keys to their committed [`CacheEntry`].
///
/// Entries are stored behind an `Arc`, so every map operation only holds its lock for as long as
/// it takes to clone or swap a pointer.
pub(crate) struct ValueStore<K, V> {
    entries: DashMap<K, Arc<CacheEntry<V>>, FxBuildHasher>,
    next_seq: AtomicU64,
    /// The instant all expiries are measured against in `earliest_expiry`.
    epoch: Instant,
    /// A lower bound of the expiry of all stored entries, in nanoseconds since `epoch`.
    earliest_expiry: AtomicU64,
}

impl<K, V> ValueStore<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(epoch: Instant) -> Self {
        Self {
            entries: DashMap::with_hasher(FxBuildHasher),
            next_seq: AtomicU64::new(0),
            epoch,
            earliest_expiry: AtomicU64::new(u64::MAX),
        }
    }

    fn nanos_since_epoch(&self, instant: Instant) -> u64 {
        let elapsed = instant.saturating_duration_since(self.epoch);
        u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
    }

    /// Creates a new entry, stamped with the next insertion sequence number.
    pub fn entry(&self, value: V, expiry: Instant, refresh_at: Option<Instant>) -> CacheEntry<V> {
        CacheEntry {
            value,
            expiry,
            refresh_at: refresh_at.map(|at| at.min(expiry)),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn read(&self, key: &K) -> Option<Arc<CacheEntry<V>>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Replaces whatever is stored under `key`.
    pub fn write(&self, key: K, entry: CacheEntry<V>) -> Arc<CacheEntry<V>> {
        let entry = Arc::new(entry);
        self.entries.insert(key, Arc::clone(&entry));
        self.earliest_expiry
            .fetch_min(self.nanos_since_epoch(entry.expiry), Ordering::AcqRel);
        entry
    }

    /// Removes the entry under `key` only if it is still the one with sequence number `seq`.
    ///
    /// Eviction decisions are made on a snapshot, so an entry might have been replaced by a
    /// fresh one in the meantime.
    pub fn remove_if_seq(&self, key: &K, seq: u64) -> bool {
        self.entries
            .remove_if(key, |_, entry| entry.seq == seq)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// A point-in-time copy of all keys and entries.
    ///
    /// Each shard of the map is copied atomically, but the snapshot as a whole is not.
    pub fn snapshot(&self) -> Vec<(K, Arc<CacheEntry<V>>)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Removes every entry that expired at or before `now`.
    ///
    /// The store is only scanned if an entry might have expired. Returns the number of removed
    /// entries.
    pub fn remove_expired(&self, now: Instant) -> usize {
        let now_nanos = self.nanos_since_epoch(now);
        if self.earliest_expiry.load(Ordering::Acquire) > now_nanos {
            return 0;
        }

        // Writes racing with the scan lower the bound again on their own.
        self.earliest_expiry.store(u64::MAX, Ordering::Release);

        let mut removed = 0;
        for (key, entry) in self.snapshot() {
            if entry.expiry <= now {
                if self.remove_if_seq(&key, entry.seq) {
                    removed += 1;
                }
            } else {
                self.earliest_expiry
                    .fetch_min(self.nanos_since_epoch(entry.expiry), Ordering::AcqRel);
            }
        }
        removed
    }
}
