use std::time::Duration;

use serde::Deserialize;

use crate::slots::DEFAULT_LOCK_SLOTS;

/// Configuration of a single [`RefreshCache`](crate::RefreshCache).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// The name of the cache, used to tag metrics and logs.
    pub name: String,

    /// How long before the hard expiry of a value a background refresh is started.
    ///
    /// Without a margin, values are served until they expire and then fetched again while the
    /// caller waits.
    #[serde(with = "humantime_serde")]
    pub refetch_before_expiry: Option<Duration>,

    /// The maximum number of values to hold.
    ///
    /// When exceeded, the values closest to their expiry are evicted first. `0` means
    /// unbounded.
    pub max_entries: usize,

    /// The number of lock slots that keys are distributed over.
    pub lock_slots: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            refetch_before_expiry: None,
            max_entries: 0,
            lock_slots: DEFAULT_LOCK_SLOTS,
        }
    }
}

impl CacheConfig {
    /// Creates a default configuration with the given cache name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether values are refreshed in the background before they expire.
    pub fn refresh_ahead(&self) -> bool {
        self.refetch_before_expiry.is_some()
    }
}
