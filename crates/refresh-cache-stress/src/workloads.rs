use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use refresh_cache::{CacheConfig, RefreshCache};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path).context("failed to open workloads file")?;
        let config: Self =
            serde_yaml::from_reader(file).context("failed to parse workloads YAML")?;

        for (i, workload) in config.workloads.iter().enumerate() {
            workload
                .validate()
                .with_context(|| format!("invalid workload {i}"))?;
        }
        Ok(config)
    }
}

/// A group of concurrent callers hammering one cache.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workload {
    /// How many lookups are running at the same time.
    pub concurrency: usize,
    /// The number of distinct keys that are looked up, chosen at random.
    pub keys: u64,
    /// How long the simulated upstream takes to produce a value.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// The share of upstream calls that fail, between `0` and `1`.
    #[serde(default)]
    pub failure_rate: f64,
    /// How long a fetched value stays valid.
    #[serde(with = "humantime_serde")]
    pub lifetime: Duration,
    /// Overrides the configured refresh margin of the cache.
    #[serde(default, with = "humantime_serde")]
    pub refresh_margin: Option<Duration>,
    /// Overrides the configured capacity of the cache, unless `0`.
    #[serde(default)]
    pub max_entries: usize,
}

impl Workload {
    fn validate(&self) -> Result<()> {
        ensure!(self.concurrency > 0, "concurrency must be at least 1");
        ensure!(self.keys > 0, "keys must be at least 1");
        ensure!(
            (0.0..=1.0).contains(&self.failure_rate),
            "failure_rate must be between 0 and 1"
        );
        Ok(())
    }

    /// The configuration of the cache for workload number `index`.
    pub fn cache_config(&self, base: &CacheConfig, index: usize) -> CacheConfig {
        let mut config = base.clone();
        config.name = format!("{}_{index}", base.name);
        if self.refresh_margin.is_some() {
            config.refetch_before_expiry = self.refresh_margin;
        }
        if self.max_entries > 0 {
            config.max_entries = self.max_entries;
        }
        config
    }

    /// Picks the key of the next lookup.
    pub fn random_key(&self) -> u64 {
        rand::random_range(0..self.keys)
    }
}

/// A value produced by the simulated upstream.
#[derive(Clone, Debug)]
pub struct Token {
    pub key: u64,
    /// Counts upstream calls across all keys, so every fetched token is distinct.
    pub generation: usize,
}

/// A simulated upstream service with a fixed latency and random failures.
#[derive(Debug)]
pub struct Upstream {
    latency: Duration,
    failure_rate: f64,
    calls: AtomicUsize,
}

impl Upstream {
    pub fn new(workload: &Workload) -> Self {
        Self {
            latency: workload.latency,
            failure_rate: workload.failure_rate,
            calls: AtomicUsize::new(0),
        }
    }

    /// The number of upstream calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Fetches a new token for `key`.
    pub fn fetch(self: Arc<Self>, key: u64) -> impl Future<Output = Result<Token>> + Send {
        let generation = self.calls.fetch_add(1, Ordering::Relaxed) + 1;

        async move {
            tokio::time::sleep(self.latency).await;
            ensure!(
                rand::random::<f64>() >= self.failure_rate,
                "upstream failed to issue token for key {key}"
            );
            Ok(Token { key, generation })
        }
    }
}

/// Creates the cache and upstream for every workload.
pub fn prepare_workloads(
    base: &CacheConfig,
    workloads: WorkloadsConfig,
) -> Vec<(Workload, RefreshCache<u64, Token>, Arc<Upstream>)> {
    workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let cache = RefreshCache::builder()
                .config(workload.cache_config(base, i))
                .build();
            let upstream = Arc::new(Upstream::new(&workload));
            (workload, cache, upstream)
        })
        .collect()
}
