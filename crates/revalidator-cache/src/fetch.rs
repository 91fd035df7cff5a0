//! Deduplicated, cancellable fetches.
//!
//! The [`FetchCoordinator`] keeps at most one in-flight fetch per key. Every caller asking for
//! a key while its fetch runs joins the same [`ResultChannel`] and receives the same result.
//! Fetches run as spawned tokio tasks, so they keep going when a caller stops waiting.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult};
use crate::key::QueryKey;
use crate::utils::{CallOnDrop, spawn_bound};

/// Produces the value for a key, usually by talking to a remote service.
///
/// The token is cancelled when the fetch is no longer wanted. Fetchers should stop their
/// transport work when that happens, the result of a cancelled fetch is dropped either way.
pub trait Fetcher<V>: Send + Sync + 'static {
    fn fetch(&self, key: QueryKey, token: CancellationToken) -> BoxFuture<'static, CacheResult<V>>;
}

impl<V, F, Fut> Fetcher<V> for F
where
    F: Fn(QueryKey, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheResult<V>> + Send + 'static,
{
    fn fetch(&self, key: QueryKey, token: CancellationToken) -> BoxFuture<'static, CacheResult<V>> {
        self(key, token).boxed()
    }
}

/// How failed fetches are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The number of additional attempts after the first failure.
    pub retries: u32,
    /// The delay before the first retry.
    pub base_delay: Duration,
    /// The upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Never retry.
    pub const NONE: RetryPolicy = RetryPolicy {
        retries: 0,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };

    /// The delay before retry number `attempt`, starting at zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Receives the lifecycle of the fetches started for one entry.
///
/// `started` is called synchronously from [`FetchCoordinator::request`], the other methods
/// from the fetch task or from [`FetchCoordinator::cancel`].
pub(crate) trait FetchSink<V>: Send + Sync + 'static {
    fn started(&self, seq: u64);

    fn cancelled(&self, seq: u64);

    /// Commits the result of a finished fetch and returns what joined callers receive.
    ///
    /// Implementations must check `token` while holding whatever lock guards the commit, so
    /// that a fetch cancelled concurrently is never written.
    fn completed(
        &self,
        key: &QueryKey,
        seq: u64,
        token: &CancellationToken,
        result: CacheResult<V>,
    ) -> CacheResult<Arc<V>>;
}

/// A sink for fetches not tied to any cache entry.
struct DetachedSink;

impl<V: Send + Sync + 'static> FetchSink<V> for DetachedSink {
    fn started(&self, _seq: u64) {}

    fn cancelled(&self, _seq: u64) {}

    fn completed(
        &self,
        _key: &QueryKey,
        _seq: u64,
        token: &CancellationToken,
        result: CacheResult<V>,
    ) -> CacheResult<Arc<V>> {
        if token.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        result.map(Arc::new)
    }
}

type ComputationChannel<V> = Shared<oneshot::Receiver<CacheResult<Arc<V>>>>;

/// The shared result of a fetch. Every clone resolves to the same value.
pub struct ResultChannel<V> {
    inner: ComputationChannel<V>,
}

impl<V> ResultChannel<V> {
    fn new(inner: ComputationChannel<V>) -> Self {
        Self { inner }
    }

    /// A channel that is already resolved with `result`.
    pub(crate) fn ready(result: CacheResult<Arc<V>>) -> Self {
        let (sender, receiver) = oneshot::channel();
        sender.send(result).ok();
        Self::new(receiver.shared())
    }
}

impl<V> Clone for ResultChannel<V> {
    fn clone(&self) -> Self {
        Self::new(self.inner.clone())
    }
}

impl<V> Future for ResultChannel<V> {
    type Output = CacheResult<Arc<V>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the fetch task went away without reporting, most likely
        // because it panicked.
        Pin::new(&mut self.get_mut().inner)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CacheError::InternalError)))
    }
}

/// The fetch that replaced a cancelled one. Callers of the cancelled fetch receive its result.
type Successor<V> = Arc<Mutex<Option<ComputationChannel<V>>>>;

struct InFlightFetch<V> {
    seq: u64,
    token: CancellationToken,
    channel: ComputationChannel<V>,
    sink: Arc<dyn FetchSink<V>>,
    successor: Successor<V>,
}

type InFlightMap<V> = Arc<Mutex<FxHashMap<QueryKey, InFlightFetch<V>>>>;

/// Deduplicates concurrent fetches per key and propagates cancellation.
pub struct FetchCoordinator<V> {
    in_flight: InFlightMap<V>,
    next_seq: AtomicU64,
}

impl<V: Send + Sync + 'static> Default for FetchCoordinator<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> FetchCoordinator<V> {
    pub fn new() -> Self {
        Self {
            in_flight: Default::default(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Joins the in-flight fetch for `key`, or starts a new one with `fetcher`.
    ///
    /// Must be called from within a tokio runtime. Outside of one, the returned channel
    /// resolves to [`CacheError::InternalError`].
    pub fn request<F: Fetcher<V>>(&self, key: QueryKey, fetcher: F) -> ResultChannel<V> {
        self.request_with(key, Arc::new(fetcher), RetryPolicy::NONE, Arc::new(DetachedSink))
    }

    /// Cancels the in-flight fetch for `key`.
    ///
    /// Joined callers receive [`CacheError::Cancelled`] and the result is discarded. Returns
    /// `false` if nothing was in flight, which makes repeated calls harmless.
    pub fn cancel(&self, key: &QueryKey) -> bool {
        let Some(fetch) = self.in_flight.lock().remove(key) else {
            return false;
        };
        cancel_fetch(key, fetch);
        true
    }

    /// Whether a fetch for `key` is currently running.
    pub fn is_in_flight(&self, key: &QueryKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// The number of fetches currently running.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// The sequence number the next fetch will get.
    ///
    /// Fetches started before this call have a smaller sequence number.
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    pub(crate) fn request_with(
        &self,
        key: QueryKey,
        fetcher: Arc<dyn Fetcher<V>>,
        retry: RetryPolicy,
        sink: Arc<dyn FetchSink<V>>,
    ) -> ResultChannel<V> {
        self.start(key, fetcher, retry, sink, false)
    }

    /// Starts a new fetch for `key`, cancelling the one in flight.
    ///
    /// Callers that joined the cancelled fetch receive the result of the new one instead of
    /// [`CacheError::Cancelled`].
    pub(crate) fn replace_with(
        &self,
        key: QueryKey,
        fetcher: Arc<dyn Fetcher<V>>,
        retry: RetryPolicy,
        sink: Arc<dyn FetchSink<V>>,
    ) -> ResultChannel<V> {
        self.start(key, fetcher, retry, sink, true)
    }

    fn start(
        &self,
        key: QueryKey,
        fetcher: Arc<dyn Fetcher<V>>,
        retry: RetryPolicy,
        sink: Arc<dyn FetchSink<V>>,
        replace: bool,
    ) -> ResultChannel<V> {
        let mut in_flight = self.in_flight.lock();
        let replaced = if replace {
            in_flight.remove(&key)
        } else {
            if let Some(fetch) = in_flight.get(&key) {
                metric!(counter("caches.fetch.dedup") += 1);
                return ResultChannel::new(fetch.channel.clone());
            }
            None
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let successor = Successor::<V>::default();
        let (sender, receiver) = oneshot::channel();

        // The task removes itself from the map once done. It can only do so after we release
        // the lock below, so it never observes a map without its own entry.
        let remove_token = {
            let in_flight = Arc::clone(&self.in_flight);
            let key = key.clone();
            CallOnDrop::new(move || {
                let mut in_flight = in_flight.lock();
                if in_flight.get(&key).is_some_and(|fetch| fetch.seq == seq) {
                    in_flight.remove(&key);
                }
            })
        };

        let task = {
            let key = key.clone();
            let token = token.clone();
            let sink = Arc::clone(&sink);
            let successor = Arc::clone(&successor);
            async move {
                let start = Instant::now();
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(CacheError::Cancelled),
                    result = fetch_with_retry(&*fetcher, &key, &token, retry) => result,
                };
                metric!(timer("caches.fetch.duration") = start.elapsed());
                let result = if token.is_cancelled() {
                    Err(CacheError::Cancelled)
                } else {
                    sink.completed(&key, seq, &token, result)
                };
                // Drop the token first to evict from the map. This ensures that callers either
                // get a channel that will receive data, or they create a new channel.
                drop(remove_token);
                let successor = successor.lock().take();
                let result = match (result, successor) {
                    (Err(CacheError::Cancelled), Some(successor)) => {
                        successor.await.unwrap_or(Err(CacheError::InternalError))
                    }
                    (result, _) => result,
                };
                sender.send(result).ok();
            }
        };

        // Check for the runtime before notifying the sink, a failed spawn would otherwise
        // leave the entry pending forever.
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::error!(%key, "Fetches need a tokio runtime");
            drop(in_flight);
            drop(task);
            if let Some(previous) = replaced {
                cancel_fetch(&key, previous);
            }
            return ResultChannel::ready(Err(CacheError::InternalError));
        }

        metric!(counter("caches.fetch") += 1);
        tracing::debug!(%key, seq, "Starting fetch");
        sink.started(seq);
        spawn_bound(task);

        let channel = receiver.shared();
        in_flight.insert(
            key.clone(),
            InFlightFetch {
                seq,
                token,
                channel: channel.clone(),
                sink,
                successor,
            },
        );
        drop(in_flight);

        if let Some(previous) = replaced {
            // The handoff is in place before the token is cancelled, so the previous task
            // always finds it.
            *previous.successor.lock() = Some(channel.clone());
            cancel_fetch(&key, previous);
        }
        ResultChannel::new(channel)
    }
}

/// Cancels a fetch that was already removed from the in-flight map.
fn cancel_fetch<V: 'static>(key: &QueryKey, fetch: InFlightFetch<V>) {
    fetch.token.cancel();
    fetch.sink.cancelled(fetch.seq);
    metric!(counter("caches.fetch.cancelled") += 1);
    tracing::debug!(%key, seq = fetch.seq, "Cancelled fetch");
}

async fn fetch_with_retry<V: 'static>(
    fetcher: &dyn Fetcher<V>,
    key: &QueryKey,
    token: &CancellationToken,
    retry: RetryPolicy,
) -> CacheResult<V> {
    let mut attempt = 0;
    loop {
        match fetcher.fetch(key.clone(), token.clone()).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < retry.retries && error.is_retryable() => {
                let delay = retry.delay_for(attempt);
                metric!(counter("caches.fetch.retry") += 1);
                tracing::debug!(%key, attempt, ?delay, %error, "Retrying failed fetch");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}
