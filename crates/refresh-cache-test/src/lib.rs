//! Helpers for testing the cache and its users.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Value factories handed out by [`Calls`] count their invocations at the moment they are
//!    called, not when their future is first polled. The count is therefore accurate right after
//!    a lookup returned, even when the fetch itself is still running in the background.
//!
//!  - A [`Gate`] holds back every factory future created from it until it is opened. Keep the
//!    gate alive for as long as those futures should be able to complete.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `refresh_cache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("refresh_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Shorthand for a duration in whole seconds.
pub fn secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

/// The value factory type handed out by [`Calls`].
pub type Factory<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// Counts how often the value factories created from it were invoked.
#[derive(Clone, Debug, Default)]
pub struct Calls {
    count: Arc<AtomicUsize>,
}

impl Calls {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many factories have been invoked so far.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn record(&self) -> usize {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// A factory resolving to `value` immediately.
    pub fn returning<T: Send + 'static>(&self, value: T) -> Factory<T> {
        let calls = self.clone();
        Box::new(move || {
            calls.record();
            async move { Ok(value) }.boxed()
        })
    }

    /// A factory resolving to the number of the invocation, starting at `1`.
    pub fn numbered(&self) -> Factory<usize> {
        let calls = self.clone();
        Box::new(move || {
            let n = calls.record();
            async move { Ok(n) }.boxed()
        })
    }

    /// A factory failing with `message`.
    pub fn failing<T: Send + 'static>(&self, message: &'static str) -> Factory<T> {
        let calls = self.clone();
        Box::new(move || {
            calls.record();
            async move { Err(anyhow::anyhow!(message)) }.boxed()
        })
    }

    /// A factory resolving to `value` once `gate` opens.
    pub fn gated<T: Send + 'static>(&self, gate: &Gate, value: T) -> Factory<T> {
        let calls = self.clone();
        let mut open = gate.subscribe();
        Box::new(move || {
            calls.record();
            async move {
                open.wait_for(|open| *open)
                    .await
                    .map_err(|_| anyhow::anyhow!("gate dropped before opening"))?;
                Ok(value)
            }
            .boxed()
        })
    }

    /// A factory failing with `message` once `gate` opens.
    pub fn gated_failing<T: Send + 'static>(
        &self,
        gate: &Gate,
        message: &'static str,
    ) -> Factory<T> {
        let calls = self.clone();
        let mut open = gate.subscribe();
        Box::new(move || {
            calls.record();
            async move {
                open.wait_for(|open| *open).await.ok();
                Err(anyhow::anyhow!(message))
            }
            .boxed()
        })
    }
}

/// Holds back gated factories until it is opened.
#[derive(Clone, Debug)]
pub struct Gate {
    sender: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Lets all current and future factories of this gate complete.
    pub fn open(&self) {
        self.sender.send_replace(true);
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Yields to the runtime until `condition` holds.
///
/// # Panics
///
/// Panics if the condition does not hold after a generous number of yields, which usually
/// means a background task is stuck.
pub async fn yield_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
