//! Drives refresh caches with configurable concurrent workloads against a simulated upstream.
//!
//! Workloads are read from a YAML file:
//!
//! ```yaml
//! workloads:
//!   - concurrency: 64
//!     keys: 16
//!     latency: 20ms
//!     failure_rate: 0.05
//!     lifetime: 2s
//!     refresh_margin: 500ms
//! ```
//!
//! After a warmup, all workloads run concurrently for the given duration. The tool then prints
//! throughput, lookup latencies, upstream calls and lookup outcomes per workload.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::config::Config;
use crate::workloads::WorkloadsConfig;

mod config;
mod logging;
mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;
    let workloads = WorkloadsConfig::load(&cli.workloads)?;

    // SAFETY: The runtime is not started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config.logging) };
    logging::init_metrics(&config.metrics)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the tokio runtime")?;

    runtime.block_on(stresstest::perform_stresstest(
        config.cache,
        workloads,
        cli.duration,
    ))
}
