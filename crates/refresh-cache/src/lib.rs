//! An in-memory cache for values that are expensive to fetch, such as access tokens or remote
//! configuration.
//!
//! The [`RefreshCache`] coalesces concurrent fetches of the same key into one, serves values
//! until they expire, and optionally refreshes them in the background shortly before they do.
//! See its documentation for the details.
//!
//! All decisions about expiry are based on an injected [`Clock`], which makes the cache fully
//! deterministic under test.

#[macro_use]
pub mod metrics;

mod cache;
mod clock;
mod config;
mod coordinator;
mod error;
mod eviction;
mod outcome;
mod policy;
mod slots;
mod store;

pub use cache::{RefreshCache, RefreshCacheBuilder};
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::CacheConfig;
pub use error::CacheError;
pub use outcome::{CacheOutcome, Observer};
pub use policy::{Freshness, Lifetime, Schedule};
pub use slots::DEFAULT_LOCK_SLOTS;
pub use store::CacheEntry;
