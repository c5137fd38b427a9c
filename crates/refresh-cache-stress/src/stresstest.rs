use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use refresh_cache::{CacheConfig, CacheOutcome, Observer, RefreshCache};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Token, Upstream, Workload, WorkloadsConfig, prepare_workloads};

/// Counts the outcomes of all lookups of one workload.
#[derive(Clone, Debug, Default)]
struct OutcomeCounts(Arc<Mutex<HashMap<CacheOutcome, usize>>>);

impl OutcomeCounts {
    fn observer(&self) -> Observer<Token> {
        let counts = Arc::clone(&self.0);
        Observer::new(move |_, outcome| {
            let mut counts = counts.lock().unwrap_or_else(PoisonError::into_inner);
            *counts.entry(outcome).or_default() += 1;
        })
    }

    fn get(&self, outcome: CacheOutcome) -> usize {
        let counts = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(&outcome).copied().unwrap_or_default()
    }
}

struct WorkloadReport {
    concurrency: usize,
    keys: u64,
    lookup_durations: DDSketch,
    upstream_calls: usize,
    outcomes: OutcomeCounts,
}

async fn lookup(
    cache: &RefreshCache<u64, Token>,
    upstream: &Arc<Upstream>,
    workload: &Workload,
    observer: &Observer<Token>,
) {
    let key = workload.random_key();
    let upstream = Arc::clone(upstream);
    let result = cache
        .get_or_create_observed(key, || upstream.fetch(key), workload.lifetime, observer)
        .await;

    match result {
        Ok(token) => {
            debug_assert_eq!(token.key, key);
            tracing::trace!(key, generation = token.generation, "Lookup finished");
        }
        Err(error) => {
            tracing::debug!(key, error = &error as &dyn std::error::Error, "Lookup failed");
        }
    }
}

pub async fn perform_stresstest(
    cache_config: CacheConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let workloads = prepare_workloads(&cache_config, workloads);

    // warmup: fill every key once, so the measurement starts with populated caches
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(workload, cache, upstream)| {
            let cache = cache.clone();
            let upstream = Arc::clone(upstream);
            let keys = workload.keys;
            let lifetime = workload.lifetime;
            tokio::spawn(async move {
                for key in 0..keys {
                    let upstream = Arc::clone(&upstream);
                    // failures are fine here, the key is fetched again during the run
                    let _ = cache
                        .get_or_create(key, || upstream.fetch(key), lifetime)
                        .await;
                }
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (workload, cache, upstream) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let calls_before = upstream.calls();

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let workload = Arc::new(workload);
            let outcomes = OutcomeCounts::default();
            let observer = outcomes.observer();
            let lookup_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let cache = cache.clone();
                        let upstream = Arc::clone(&upstream);
                        let workload = Arc::clone(&workload);
                        let observer = observer.clone();
                        let lookup_durations = Arc::clone(&lookup_durations);
                        let lookup_start = Instant::now();

                        tokio::spawn(async move {
                            lookup(&cache, &upstream, &workload, &observer).await;

                            lookup_durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(lookup_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the permits, we wait for all outstanding lookups to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let lookup_durations = std::mem::take(
                &mut *lookup_durations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );

            WorkloadReport {
                concurrency,
                keys: workload.keys,
                lookup_durations,
                upstream_calls: upstream.calls() - calls_before,
                outcomes,
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let report = task.with_context(|| format!("workload {i} panicked"))?;
        print_report(i, &report, duration);
    }

    Ok(())
}

fn print_report(i: usize, report: &WorkloadReport, duration: Duration) {
    let WorkloadReport {
        concurrency,
        keys,
        lookup_durations,
        upstream_calls,
        outcomes,
    } = report;

    let ops = lookup_durations.count();
    let ops_ps = ops as f64 / duration.as_secs_f64();
    println!(
        "Workload {i} (concurrency: {concurrency}, keys: {keys}): {ops} lookups, {ops_ps:.2} ops/s"
    );

    if ops > 0 {
        let quantile = |q| {
            let secs = lookup_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(lookup_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    print!("  upstream calls: {upstream_calls}");
    for outcome in [
        CacheOutcome::Cached,
        CacheOutcome::Refreshed,
        CacheOutcome::Expired,
        CacheOutcome::New,
        CacheOutcome::Error,
    ] {
        print!("; {outcome}: {}", outcomes.get(outcome));
    }
    println!();
}
