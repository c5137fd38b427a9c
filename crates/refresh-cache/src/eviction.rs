//! Keeping the store bounded.

use std::hash::Hash;
use std::time::Instant;

use crate::store::ValueStore;

/// Removes expired entries and enforces the configured capacity.
///
/// This is run on every commit. Only committed entries are affected; running fetches are not.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EvictionPolicy {
    /// `0` means unbounded.
    max_entries: usize,
}

impl EvictionPolicy {
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }

    /// Removes every entry that expired at or before `now`.
    ///
    /// Returns the number of removed entries.
    pub fn prune_expired<K, V>(&self, store: &ValueStore<K, V>, now: Instant) -> usize
    where
        K: Eq + Hash + Clone,
    {
        store.remove_expired(now)
    }

    /// Evicts the entries closest to expiry until the store fits its capacity.
    ///
    /// Entries with equal expiry are evicted in insertion order. Returns the number of evicted
    /// entries.
    pub fn enforce_capacity<K, V>(&self, store: &ValueStore<K, V>) -> usize
    where
        K: Eq + Hash + Clone,
    {
        if self.max_entries == 0 || store.len() <= self.max_entries {
            return 0;
        }

        let mut entries = store.snapshot();
        let overflow = entries.len().saturating_sub(self.max_entries);
        entries.sort_by_key(|(_, entry)| (entry.expiry(), entry.seq()));

        entries
            .into_iter()
            .take(overflow)
            .filter(|(key, entry)| store.remove_if_seq(key, entry.seq()))
            .count()
    }
}
