use std::hash::{BuildHasher, Hash};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxBuildHasher;

/// The default number of lock slots, independent of how many keys are cached.
pub const DEFAULT_LOCK_SLOTS: usize = 32;

/// Maps keys onto a fixed number of slots by `hash(key) mod N`.
///
/// Unrelated keys can land in the same slot and will then contend on the same lock. That is the
/// price for keeping the number of locks bounded.
#[derive(Clone, Copy)]
pub(crate) struct SlotSelector {
    hasher: FxBuildHasher,
    slots: usize,
}

impl SlotSelector {
    pub fn new(slots: usize) -> Self {
        Self {
            hasher: FxBuildHasher,
            slots: slots.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.slots
    }

    pub fn slot_for<K: Hash + ?Sized>(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) % self.slots as u64) as usize
    }
}

/// Locks `mutex`, recovering from poisoning.
///
/// Slot registries are only changed by whole-value inserts and removals, so a poisoned lock still
/// guards consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
