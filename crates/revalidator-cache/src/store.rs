//! The top-level cache: a map from [`QueryKey`] to cache entries.

use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::compare::{DeepEq, StructuralComparator};
use crate::config::{CacheConfig, EntryConfig};
use crate::entry::{Entry, EntrySnapshot, EntryState, GcStep, SavedEntry};
use crate::error::{CacheError, CacheResult};
use crate::fetch::{FetchCoordinator, FetchSink, Fetcher, ResultChannel};
use crate::key::QueryKey;
use crate::observer::{Notifiable, ObserverId};
use crate::utils::spawn_bound;

type EntryMap<V> = FxHashMap<QueryKey, Arc<Entry<V>>>;

struct StoreInner<V> {
    entries: RwLock<EntryMap<V>>,
    config: RwLock<CacheConfig>,
    comparator: Arc<dyn StructuralComparator<V>>,
    fetcher: Option<Arc<dyn Fetcher<V>>>,
    fetches: FetchCoordinator<V>,
}

/// A reactive cache of asynchronously produced values.
///
/// `CacheStore` is a cheap handle, all clones share the same entries. Values are served from
/// the cache while fresh, revalidated in the background once stale, and collected some time
/// after the last observer went away.
///
/// Locks are never held across `.await` points or while observers run. The map lock is always
/// taken before an entry lock.
pub struct CacheStore<V> {
    inner: Arc<StoreInner<V>>,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Send + Sync + 'static> std::fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.inner.entries.read().len())
            .field("in_flight", &self.inner.fetches.in_flight_count())
            .finish()
    }
}

/// Builds a [`CacheStore`] with a custom comparator or a default fetcher.
pub struct CacheStoreBuilder<V> {
    config: CacheConfig,
    comparator: Arc<dyn StructuralComparator<V>>,
    fetcher: Option<Arc<dyn Fetcher<V>>>,
}

impl<V: Send + Sync + 'static> CacheStoreBuilder<V> {
    /// Replaces the comparator used to detect unchanged values.
    pub fn comparator(mut self, comparator: impl StructuralComparator<V>) -> Self {
        self.comparator = Arc::new(comparator);
        self
    }

    /// Installs a fetcher used for keys that were never queried with one.
    pub fn fetcher(mut self, fetcher: impl Fetcher<V>) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    pub fn build(self) -> CacheStore<V> {
        CacheStore {
            inner: Arc::new(StoreInner {
                entries: Default::default(),
                config: RwLock::new(self.config),
                comparator: self.comparator,
                fetcher: self.fetcher,
                fetches: FetchCoordinator::new(),
            }),
        }
    }
}

impl<V: PartialEq + Send + Sync + 'static> CacheStore<V> {
    /// Creates a store comparing values with [`DeepEq`].
    pub fn new(config: CacheConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: CacheConfig) -> CacheStoreBuilder<V> {
        Self::with_comparator(config, DeepEq)
    }

    /// Creates a store with a default fetcher for every key.
    pub fn with_fetcher(config: CacheConfig, fetcher: impl Fetcher<V>) -> Self {
        Self::builder(config).fetcher(fetcher).build()
    }
}

impl<V: Send + Sync + 'static> CacheStore<V> {
    /// Starts building a store that compares values with `comparator`.
    pub fn with_comparator(
        config: CacheConfig,
        comparator: impl StructuralComparator<V>,
    ) -> CacheStoreBuilder<V> {
        CacheStoreBuilder {
            config,
            comparator: Arc::new(comparator),
            fetcher: None,
        }
    }

    /// Looks up an entry.
    ///
    /// When the entry is stale and a fetcher is known for it, a background refetch is started
    /// and the cached value is returned right away.
    pub fn get(&self, key: &QueryKey) -> Option<EntrySnapshot<V>> {
        let now = Instant::now();
        let entry = self.lookup(key)?;
        let (snapshot, revalidate) = {
            let state = entry.state.lock();
            let revalidate = state.is_stale(now) && !state.is_fetching();
            (state.snapshot(key, now), revalidate)
        };
        metric!(counter("caches.access") += 1, "op" => "get");
        if revalidate {
            tracing::trace!(%key, "Revalidating stale entry");
            self.start_fetch(&entry, None, false);
        } else if snapshot.value.is_some() {
            metric!(counter("caches.memory.hit") += 1);
        }
        Some(snapshot)
    }

    /// Looks up an entry without any side effects.
    pub fn peek(&self, key: &QueryKey) -> Option<EntrySnapshot<V>> {
        let now = Instant::now();
        let entry = self.lookup(key)?;
        let state = entry.state.lock();
        Some(state.snapshot(key, now))
    }

    /// Returns the entry for `key`, creating an idle one if it does not exist.
    pub fn get_or_create(&self, key: &QueryKey) -> EntrySnapshot<V> {
        let now = Instant::now();
        self.update(key, |state| state.snapshot(key, now)).1
    }

    /// Writes a value directly.
    ///
    /// Returns `false` if the value is structurally equal to the cached one, in which case
    /// the cached `Arc` is kept and observers are not notified.
    pub fn set(&self, key: QueryKey, value: V) -> bool {
        let now = Instant::now();
        let comparator = Arc::clone(&self.inner.comparator);
        let (_, (_, changed)) = self.update(&key, |state| state.set(value, &*comparator, now));
        if !changed {
            metric!(counter("caches.set.unchanged") += 1);
            tracing::trace!(%key, "Ignoring unchanged value");
        }
        changed
    }

    /// Returns the value for `key`, fetching it with `fetcher` when needed.
    ///
    /// Fresh values are returned directly. Stale values are returned as well, while a
    /// refetch runs in the background. Without a value, this waits for the fetch, joining one
    /// that is already running.
    pub async fn query<F: Fetcher<V>>(&self, key: &QueryKey, fetcher: F) -> CacheResult<Arc<V>> {
        let fetcher: Arc<dyn Fetcher<V>> = Arc::new(fetcher);
        self.query_with(key, Some(fetcher)).await
    }

    /// Like [`query`](Self::query), with the fetcher known for the key.
    pub async fn query_known(&self, key: &QueryKey) -> CacheResult<Arc<V>> {
        self.query_with(key, None).await
    }

    async fn query_with(
        &self,
        key: &QueryKey,
        fetcher: Option<Arc<dyn Fetcher<V>>>,
    ) -> CacheResult<Arc<V>> {
        let now = Instant::now();
        let (entry, (value, stale), gc_timer) = self.update_deferred(key, |state| {
            if let Some(fetcher) = &fetcher {
                state.fetcher = Some(Arc::clone(fetcher));
            }
            (state.value.clone(), state.is_stale(now))
        });
        metric!(counter("caches.access") += 1, "op" => "query");

        // The fetch starts before the collection timer of a new entry, which keeps entries
        // with a running fetch.
        let channel = match value {
            Some(_) if !stale => None,
            _ => self.start_fetch(&entry, fetcher, false),
        };
        self.start_gc_timer(&entry, gc_timer);

        match (value, channel) {
            (Some(value), _) if !stale => {
                metric!(counter("caches.memory.hit") += 1);
                tracing::trace!(%key, "Serving fresh value");
                Ok(value)
            }
            (Some(value), _) => {
                tracing::trace!(%key, "Serving stale value while revalidating");
                Ok(value)
            }
            (None, Some(channel)) => channel.await,
            (None, None) => Err(CacheError::NotFound),
        }
    }

    /// Fetches `key` with `fetcher`, joining a fetch that is already running.
    pub fn fetch<F: Fetcher<V>>(&self, key: &QueryKey, fetcher: F) -> ResultChannel<V> {
        let fetcher: Arc<dyn Fetcher<V>> = Arc::new(fetcher);
        let (entry, _, gc_timer) = self.update_deferred(key, |_| ());
        let channel = self.start_fetch(&entry, Some(fetcher), false);
        self.start_gc_timer(&entry, gc_timer);
        channel.unwrap_or_else(|| ResultChannel::ready(Err(CacheError::InternalError)))
    }

    /// Fetches `key` with the fetcher known for it.
    ///
    /// Resolves to [`CacheError::NotFound`] if there is neither an entry with a fetcher nor a
    /// default fetcher.
    pub fn refetch(&self, key: &QueryKey) -> ResultChannel<V> {
        let channel = self
            .lookup(key)
            .and_then(|entry| self.start_fetch(&entry, None, false))
            .or_else(|| {
                let fetcher = self.inner.fetcher.clone()?;
                let (entry, _, gc_timer) = self.update_deferred(key, |_| ());
                let channel = self.start_fetch(&entry, Some(fetcher), false);
                self.start_gc_timer(&entry, gc_timer);
                channel
            });
        channel.unwrap_or_else(|| ResultChannel::ready(Err(CacheError::NotFound)))
    }

    /// Cancels the running fetch for `key`. Returns `false` if there was none.
    pub fn cancel(&self, key: &QueryKey) -> bool {
        self.inner.fetches.cancel(key)
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.inner.fetches.is_in_flight(key)
    }

    /// Marks every entry under `prefix` as stale.
    ///
    /// Observed entries are refetched right away. A fetch that started before the invalidation
    /// is replaced, and whoever waits for it receives the result of the new fetch. Unobserved
    /// entries are refetched on their next use. Returns the number of entries touched.
    ///
    /// A prefix that matches no entry is a bug in the caller. Debug builds panic, release
    /// builds log a warning.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let touched = self.invalidate_matching(|key| key.matches(prefix));
        if touched == 0 {
            tracing::warn!(%prefix, "Invalidation did not match any entry");
            debug_assert!(touched > 0, "invalidated {prefix}, which matches no entry");
        }
        touched
    }

    /// Marks every entry as stale.
    pub fn invalidate_all(&self) -> usize {
        self.invalidate_matching(|_| true)
    }

    /// Invalidates the entries whose key satisfies `matches`.
    ///
    /// Matching nothing is fine here. Mutations settle keys that may have been collected
    /// in the meantime.
    pub(crate) fn invalidate_matching(&self, matches: impl Fn(&QueryKey) -> bool) -> usize {
        let next_seq = self.inner.fetches.next_seq();
        let mut touched = 0;
        let mut refetch = Vec::new();
        {
            let entries = self.inner.entries.read();
            for entry in entries.values().filter(|entry| matches(&entry.key)) {
                let mut state = entry.state.lock();
                state.invalidate(next_seq);
                touched += 1;
                if state.has_observers() {
                    refetch.push(Arc::clone(entry));
                }
            }
        }

        metric!(counter("caches.invalidated") += touched as i64);
        for entry in refetch {
            self.start_fetch(&entry, None, true);
        }
        touched
    }

    /// Removes an entry and cancels its fetch.
    ///
    /// Entries with observers are never removed, this returns `false` for them.
    pub fn remove(&self, key: &QueryKey) -> bool {
        {
            let mut entries = self.inner.entries.write();
            let Some(entry) = entries.get(key) else {
                return false;
            };
            if entry.state.lock().has_observers() {
                tracing::warn!(%key, "Refusing to remove an observed entry");
                return false;
            }
            entries.remove(key);
        }
        self.cancel(key);
        true
    }

    /// Removes every entry without observers.
    pub fn clear(&self) -> usize {
        let removed: Vec<_> = {
            let mut entries = self.inner.entries.write();
            let removed = entries
                .iter()
                .filter(|(_, entry)| !entry.state.lock().has_observers())
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            for key in &removed {
                entries.remove(key);
            }
            removed
        };
        for key in &removed {
            self.cancel(key);
        }
        removed.len()
    }

    /// Registers `observer` for changes to `key`, creating the entry if needed.
    ///
    /// The returned [`Subscription`] unregisters the observer when dropped.
    pub fn subscribe(&self, key: QueryKey, observer: impl Notifiable<V>) -> Subscription<V> {
        let id = ObserverId::next();
        let observer: Arc<dyn Notifiable<V>> = Arc::new(observer);
        self.register(&key, id, Arc::clone(&observer));
        Subscription {
            store: self.clone(),
            key,
            id,
            observer,
        }
    }

    fn register(&self, key: &QueryKey, id: ObserverId, observer: Arc<dyn Notifiable<V>>) {
        self.update(key, |state| state.subscribe(id, observer));
        tracing::trace!(%key, ?id, "Observer subscribed");
    }

    /// Unregisters an observer. Returns `false` if it was not registered on `key`.
    ///
    /// When the last observer leaves, the entry is collected after its `gc_time`.
    pub fn unsubscribe(&self, key: &QueryKey, id: ObserverId) -> bool {
        let now = Instant::now();
        self.update_existing(key, |state| state.unsubscribe(id, now))
            .is_some_and(|(_, removed)| removed)
    }

    /// The number of observers registered on `key`.
    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.lookup(key)
            .map(|entry| entry.state.lock().observer_count())
            .unwrap_or_default()
    }

    /// Snapshots of every entry, for dehydration.
    pub fn entries(&self) -> Vec<EntrySnapshot<V>> {
        let now = Instant::now();
        let entries = self.inner.entries.read();
        entries
            .iter()
            .map(|(key, entry)| entry.state.lock().snapshot(key, now))
            .collect()
    }

    /// Seeds `key` with a value produced at `updated_at`, for example on another machine.
    ///
    /// The value is ignored when the entry already holds newer data. Returns whether the
    /// value changed.
    pub fn hydrate(&self, key: QueryKey, value: V, updated_at: SystemTime) -> bool {
        let now = Instant::now();
        let comparator = Arc::clone(&self.inner.comparator);
        self.update(&key, |state| state.hydrate(value, updated_at, &*comparator, now))
            .1
    }

    /// Removes every unobserved entry whose collection deadline has passed.
    ///
    /// Timers do this on their own within a tokio runtime. Entries with a running fetch are
    /// kept.
    pub fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| {
            let state = entry.state.lock();
            state.is_fetching() || !state.is_collectable(now)
        });
        let evicted = before - entries.len();
        metric!(counter("caches.gc.evicted") += evicted as i64);
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Changes the settings for every key under `prefix`, including existing entries.
    pub fn configure_prefix(&self, prefix: QueryKey, config: EntryConfig) {
        let resolved = {
            let mut cache_config = self.inner.config.write();
            cache_config.set_prefix(prefix.clone(), config);
            cache_config.clone()
        };
        let entries = self.inner.entries.read();
        for (key, entry) in entries.iter().filter(|(key, _)| key.matches(&prefix)) {
            entry.state.lock().config = resolved.resolve(key);
        }
    }

    /// The settings that apply to `key`.
    pub fn entry_config(&self, key: &QueryKey) -> EntryConfig {
        self.inner.config.read().resolve(key)
    }

    /// The fetch coordinator shared by all entries of this store.
    pub fn fetches(&self) -> &FetchCoordinator<V> {
        &self.inner.fetches
    }

    pub(crate) fn save_entry(&self, key: &QueryKey) -> SavedEntry<V> {
        match self.lookup(key) {
            Some(entry) => entry.state.lock().save(),
            None => SavedEntry::absent(),
        }
    }

    pub(crate) fn restore_entry(&self, key: &QueryKey, saved: SavedEntry<V>) {
        let now = Instant::now();
        if saved.value().is_none() && self.lookup(key).is_none() {
            return;
        }
        self.update(key, |state| state.restore(saved, now));
    }

    fn lookup(&self, key: &QueryKey) -> Option<Arc<Entry<V>>> {
        self.inner.entries.read().get(key).cloned()
    }

    /// Runs `f` on the state of the entry for `key`, creating the entry if needed.
    ///
    /// The entry lock is taken while the map lock is still held, so the collector cannot
    /// remove the entry before `f` ran. Queued events are delivered and timers started once
    /// both locks are released.
    fn update<R>(
        &self,
        key: &QueryKey,
        f: impl FnOnce(&mut EntryState<V>) -> R,
    ) -> (Arc<Entry<V>>, R) {
        let (entry, result, gc_timer) = self.update_deferred(key, f);
        self.start_gc_timer(&entry, gc_timer);
        (entry, result)
    }

    /// Like [`update`](Self::update), but leaves starting the collection timer to the caller.
    fn update_deferred<R>(
        &self,
        key: &QueryKey,
        f: impl FnOnce(&mut EntryState<V>) -> R,
    ) -> (Arc<Entry<V>>, R, Option<Instant>) {
        {
            let entries = self.inner.entries.read();
            if let Some(entry) = entries.get(key) {
                let entry = Arc::clone(entry);
                let (result, gc_timer) = locked_update(&entry, entries, f);
                return (entry, result, gc_timer);
            }
        }

        let mut entries = self.inner.entries.write();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::trace!(%key, "Creating entry");
                let config = self.entry_config(key);
                Arc::new(Entry::new(key.clone(), config, Instant::now()))
            })
            .clone();
        let (result, gc_timer) = locked_update(&entry, entries, f);
        (entry, result, gc_timer)
    }

    /// Like [`update`](Self::update), but does nothing when there is no entry.
    fn update_existing<R>(
        &self,
        key: &QueryKey,
        f: impl FnOnce(&mut EntryState<V>) -> R,
    ) -> Option<(Arc<Entry<V>>, R)> {
        let entries = self.inner.entries.read();
        let entry = Arc::clone(entries.get(key)?);
        let (result, gc_timer) = locked_update(&entry, entries, f);
        self.start_gc_timer(&entry, gc_timer);
        Some((entry, result))
    }

    /// Starts or joins a fetch for `entry`.
    ///
    /// Uses `fetcher`, or the one last used for the entry, or the store's default one.
    /// Returns `None` when no fetcher is known. With `replace_running`, a fetch in flight is
    /// cancelled and its callers are handed the new one.
    fn start_fetch(
        &self,
        entry: &Arc<Entry<V>>,
        fetcher: Option<Arc<dyn Fetcher<V>>>,
        replace_running: bool,
    ) -> Option<ResultChannel<V>> {
        let (fetcher, retry) = {
            let mut state = entry.state.lock();
            let fetcher = fetcher
                .or_else(|| state.fetcher.clone())
                .or_else(|| self.inner.fetcher.clone());
            let Some(fetcher) = fetcher else {
                tracing::debug!(key = %entry.key, "No fetcher known for entry");
                return None;
            };
            state.fetcher = Some(Arc::clone(&fetcher));
            (fetcher, state.config.retry_policy())
        };

        let sink = Arc::new(EntrySink {
            entry: Arc::clone(entry),
            comparator: Arc::clone(&self.inner.comparator),
            store: Arc::downgrade(&self.inner),
        });
        let key = entry.key.clone();
        let channel = if replace_running {
            self.inner.fetches.replace_with(key, fetcher, retry, sink)
        } else {
            self.inner.fetches.request_with(key, fetcher, retry, sink)
        };
        Some(channel)
    }

    /// Starts the collection timer of `entry`, if one was requested.
    ///
    /// The timer holds only weak references, so it keeps neither a dropped store nor a removed
    /// entry alive. Outside of a tokio runtime no timer runs, and
    /// [`collect_garbage`](Self::collect_garbage) has to be called instead.
    fn start_gc_timer(&self, entry: &Arc<Entry<V>>, deadline: Option<Instant>) {
        let Some(mut deadline) = deadline else {
            return;
        };
        if deadline <= Instant::now() {
            match self.poll_gc(entry) {
                Some(next) => deadline = next,
                None => return,
            }
        }

        let store = Arc::downgrade(&self.inner);
        let weak_entry = Arc::downgrade(entry);
        let spawned = spawn_bound(async move {
            loop {
                tokio::time::sleep_until(deadline).await;
                let (Some(inner), Some(entry)) = (store.upgrade(), weak_entry.upgrade()) else {
                    return;
                };
                match (CacheStore { inner }).poll_gc(&entry) {
                    Some(next) => deadline = next,
                    None => return,
                }
            }
        });
        if !spawned {
            tracing::trace!("No runtime to schedule garbage collection");
            entry.state.lock().stop_gc_timer();
        }
    }

    /// Runs one step of the collection timer of `entry`.
    ///
    /// Returns when to check back, or `None` once the timer is done.
    fn poll_gc(&self, entry: &Arc<Entry<V>>) -> Option<Instant> {
        let now = Instant::now();
        let mut entries = self.inner.entries.write();
        let mut state = entry.state.lock();
        if !entries
            .get(&entry.key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            // Removed or replaced by someone else.
            state.stop_gc_timer();
            return None;
        }
        match state.poll_gc(now) {
            GcStep::Sleep(deadline) => Some(deadline),
            GcStep::Stop => None,
            GcStep::Collect => {
                drop(state);
                entries.remove(&entry.key);
                metric!(counter("caches.gc.evicted") += 1);
                tracing::debug!(key = %entry.key, "Collected unobserved entry");
                None
            }
        }
    }
}

/// Runs `f` under the lock of `entry`, releasing `map_guard` once the entry is locked.
///
/// Returns the deadline of a collection timer that `f` requested.
fn locked_update<V: Send + Sync + 'static, G, R>(
    entry: &Arc<Entry<V>>,
    map_guard: G,
    f: impl FnOnce(&mut EntryState<V>) -> R,
) -> (R, Option<Instant>) {
    let mut state = entry.state.lock();
    drop(map_guard);
    let result = f(&mut state);
    let gc_timer = state.take_gc_timer();
    drop(state);
    entry.notify();
    (result, gc_timer)
}

/// Commits fetch results into a cache entry.
struct EntrySink<V> {
    entry: Arc<Entry<V>>,
    comparator: Arc<dyn StructuralComparator<V>>,
    store: Weak<StoreInner<V>>,
}

impl<V: Send + Sync + 'static> EntrySink<V> {
    fn finish(&self, gc_timer: Option<Instant>) {
        if let (Some(_), Some(inner)) = (gc_timer, self.store.upgrade()) {
            CacheStore { inner }.start_gc_timer(&self.entry, gc_timer);
        }
        self.entry.notify();
    }
}

impl<V: Send + Sync + 'static> FetchSink<V> for EntrySink<V> {
    fn started(&self, seq: u64) {
        self.entry.state.lock().begin_fetch(seq);
    }

    fn cancelled(&self, seq: u64) {
        let gc_timer = {
            let mut state = self.entry.state.lock();
            state.abort_fetch(seq, Instant::now());
            state.take_gc_timer()
        };
        self.finish(gc_timer);
    }

    fn completed(
        &self,
        key: &QueryKey,
        seq: u64,
        token: &CancellationToken,
        result: CacheResult<V>,
    ) -> CacheResult<Arc<V>> {
        let now = Instant::now();
        let mut state = self.entry.state.lock();
        if token.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let result = state.complete_fetch(key, seq, result, &*self.comparator, now);
        let gc_timer = state.take_gc_timer();
        drop(state);
        self.finish(gc_timer);
        result
    }
}

/// Keeps an observer registered on a key. Dropping it unsubscribes.
pub struct Subscription<V: Send + Sync + 'static> {
    store: CacheStore<V>,
    key: QueryKey,
    id: ObserverId,
    observer: Arc<dyn Notifiable<V>>,
}

impl<V: Send + Sync + 'static> Subscription<V> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// The current state of the observed entry.
    pub fn current(&self) -> Option<EntrySnapshot<V>> {
        self.store.peek(&self.key)
    }

    /// Moves the observer to another key.
    ///
    /// The observer is registered on the new entry before it leaves the old one, so neither
    /// entry is without observers during the handoff.
    pub fn resubscribe(&mut self, key: QueryKey) {
        if key == self.key {
            return;
        }
        self.store.register(&key, self.id, Arc::clone(&self.observer));
        let previous = std::mem::replace(&mut self.key, key);
        self.store.unsubscribe(&previous, self.id);
    }

    /// Unsubscribes right away.
    pub fn unsubscribe(self) {}
}

impl<V: Send + Sync + 'static> Drop for Subscription<V> {
    fn drop(&mut self) {
        self.store.unsubscribe(&self.key, self.id);
        tracing::trace!(key = %self.key, id = ?self.id, "Observer unsubscribed");
    }
}

impl<V: Send + Sync + 'static> std::fmt::Debug for Subscription<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
