//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Tests that depend on timing should run with a paused tokio clock
//!    (`#[tokio::test(start_paused = true)]`) and move it forward with
//!    [`tokio::time::advance`]. The [`CountingFetcher`] sleeps on that clock, so its latency
//!    is fully deterministic.
//!
//!  - Keep [`Subscription`](revalidator_cache::Subscription)s in a variable for as long as the
//!    test needs the observer. Dropping one unsubscribes, which arms garbage collection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use revalidator_cache::{
    CacheEvent, CacheResult, CancellationToken, Fetcher, Notifiable, QueryKey,
};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `revalidator_cache` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("revalidator_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Lets the background tasks spawned by the cache run until they block.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

type Respond<V> = dyn Fn(&QueryKey, usize) -> CacheResult<V> + Send + Sync;

/// A [`Fetcher`] that counts its calls and answers after a fixed latency.
///
/// The response is computed by a closure receiving the key and the 1-based number of the
/// call. Clones share their counters.
pub struct CountingFetcher<V> {
    calls: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<CancellationToken>>>,
    latency: Duration,
    respond: Arc<Respond<V>>,
}

impl<V> Clone for CountingFetcher<V> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
            tokens: Arc::clone(&self.tokens),
            latency: self.latency,
            respond: Arc::clone(&self.respond),
        }
    }
}

impl<V> CountingFetcher<V> {
    pub fn new<F>(latency: Duration, respond: F) -> Self
    where
        F: Fn(&QueryKey, usize) -> CacheResult<V> + Send + Sync + 'static,
    {
        Self {
            calls: Default::default(),
            tokens: Default::default(),
            latency,
            respond: Arc::new(respond),
        }
    }

    /// The number of times the fetcher was called so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The cancellation token handed to the `n`-th call, starting at 1.
    pub fn token(&self, n: usize) -> Option<CancellationToken> {
        self.tokens.lock().get(n.checked_sub(1)?).cloned()
    }
}

impl<V: Send + Sync + 'static> Fetcher<V> for CountingFetcher<V> {
    fn fetch(&self, key: QueryKey, token: CancellationToken) -> BoxFuture<'static, CacheResult<V>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.tokens.lock().push(token);
        let latency = self.latency;
        let respond = Arc::clone(&self.respond);
        async move {
            tokio::time::sleep(latency).await;
            respond(&key, call)
        }
        .boxed()
    }
}

/// An observer that records every event it receives.
pub struct RecordingObserver<V> {
    events: Arc<Mutex<Vec<CacheEvent<V>>>>,
}

impl<V> Clone for RecordingObserver<V> {
    fn clone(&self) -> Self {
        Self {
            events: Arc::clone(&self.events),
        }
    }
}

impl<V> Default for RecordingObserver<V> {
    fn default() -> Self {
        Self {
            events: Default::default(),
        }
    }
}

impl<V> RecordingObserver<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CacheEvent<V>> {
        self.events.lock().clone()
    }

    /// The values carried by update events, in delivery order.
    pub fn values(&self) -> Vec<Option<Arc<V>>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                CacheEvent::Updated(value) => Some(value.clone()),
                CacheEvent::Failed(_) => None,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    /// One line per event, for snapshot assertions.
    pub fn describe(&self) -> String
    where
        V: fmt::Debug,
    {
        let events = self.events.lock();
        let lines: Vec<_> = events
            .iter()
            .map(|event| match event {
                CacheEvent::Updated(Some(value)) => format!("updated: {value:?}"),
                CacheEvent::Updated(None) => "updated: <none>".to_owned(),
                CacheEvent::Failed(error) => format!("failed: {error}"),
            })
            .collect();
        lines.join("\n")
    }
}

impl<V: Send + Sync + 'static> Notifiable<V> for RecordingObserver<V> {
    fn on_event(&self, _key: &QueryKey, event: &CacheEvent<V>) {
        self.events.lock().push(event.clone());
    }
}
