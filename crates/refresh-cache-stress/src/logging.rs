use std::collections::BTreeMap;
use std::env;

use anyhow::{Context, Result};
use refresh_cache::metrics;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::fmt;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

use crate::config::{LogFormat, Logging, Metrics};

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             refresh_cache=DEBUG,\
             refresh_cache_stress=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             refresh_cache=TRACE,\
             refresh_cache_stress=TRACE"
        }
    }
}

/// Initializes logging for the stress tool.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in the
/// configuration. Additionally, this toggles `RUST_BACKTRACE` based on the
/// [`enable_backtraces`](crate::config::Logging::enable_backtraces) config value.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the
/// environment.
pub unsafe fn init_logging(config: &Logging) {
    if config.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.level).to_string());

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    let fmt_layer = match (config.format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            layer.compact().with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => {
            fmt()
                .with_timer(UtcTime::rfc_3339())
                .with_target(true)
                .with_env_filter(rust_log.as_str())
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .init();
            return;
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(&rust_log)))
        .init();
}

/// Starts reporting metrics to statsd, if configured.
pub fn init_metrics(config: &Metrics) -> Result<()> {
    let Some(statsd) = config.statsd.as_deref() else {
        return Ok(());
    };

    // have some default tags, just to tell stress runs apart from real traffic
    let mut tags = BTreeMap::new();
    tags.insert("env".into(), "stresstest".into());
    tags.extend(config.custom_tags.clone());

    metrics::configure_statsd(&config.prefix, statsd, tags)
        .with_context(|| format!("failed to set up statsd reporting to {statsd}"))
}
