//! Cache entries and their lifecycle.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::compare::{StructuralComparator, share_structure};
use crate::config::EntryConfig;
use crate::error::{CacheError, CacheResult};
use crate::fetch::Fetcher;
use crate::key::QueryKey;
use crate::observer::{CacheEvent, Notifiable, ObserverId, ObserverRegistry};

/// The fetch state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    /// Created, never fetched or written.
    Idle,
    /// A fetch is running.
    Pending,
    /// Holds a value younger than its stale time.
    Fresh,
    /// Holds a value that should be refetched on next use.
    Stale,
    /// The last fetch failed. A previous value may still be present.
    Error,
}

/// A point-in-time view of a cache entry.
#[derive(Debug, Serialize)]
pub struct EntrySnapshot<V> {
    pub key: QueryKey,
    pub value: Option<Arc<V>>,
    pub status: FetchStatus,
    /// Wall clock time of the last value change.
    pub updated_at: Option<SystemTime>,
    #[serde(skip)]
    pub error: Option<CacheError>,
    #[serde(skip)]
    pub fetched_at: Option<Instant>,
    #[serde(skip)]
    pub stale_at: Option<Instant>,
    #[serde(skip)]
    pub gc_at: Option<Instant>,
    #[serde(skip)]
    pub observers: usize,
    #[serde(skip)]
    pub is_fetching: bool,
    #[serde(skip)]
    pub failure_count: u32,
}

impl<V> Clone for EntrySnapshot<V> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            status: self.status,
            updated_at: self.updated_at,
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            stale_at: self.stale_at,
            gc_at: self.gc_at,
            observers: self.observers,
            is_fetching: self.is_fetching,
            failure_count: self.failure_count,
        }
    }
}

/// What the collection timer of an entry does after waking up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GcStep {
    /// Remove the entry.
    Collect,
    /// The deadline moved, sleep until then.
    Sleep(Instant),
    /// The entry is observed or kept forever. The timer ends.
    Stop,
}

/// The state of an entry as it was before a mutation touched it.
pub(crate) struct SavedEntry<V> {
    value: Option<Arc<V>>,
    status: FetchStatus,
    fetched_at: Option<Instant>,
    updated_at: Option<SystemTime>,
    error: Option<CacheError>,
}

impl<V> SavedEntry<V> {
    /// The state of a key that has no entry.
    pub fn absent() -> Self {
        Self {
            value: None,
            status: FetchStatus::Idle,
            fetched_at: None,
            updated_at: None,
            error: None,
        }
    }

    pub fn value(&self) -> Option<&Arc<V>> {
        self.value.as_ref()
    }
}

pub(crate) struct Entry<V> {
    pub key: QueryKey,
    pub state: Mutex<EntryState<V>>,
}

pub(crate) struct EntryState<V> {
    pub value: Option<Arc<V>>,
    status: FetchStatus,
    status_before_fetch: FetchStatus,
    fetched_at: Option<Instant>,
    updated_at: Option<SystemTime>,
    error: Option<CacheError>,
    failure_count: u32,

    /// Set by invalidation. Only fetches with a sequence number of at least
    /// `invalidated_before` clear it again, older ones may carry outdated data.
    invalidated: bool,
    invalidated_before: u64,

    pub config: EntryConfig,
    /// The fetcher last used for this key, reused for refetches.
    pub fetcher: Option<Arc<dyn Fetcher<V>>>,
    fetching: Option<u64>,
    last_fetch_seq: Option<u64>,

    observers: ObserverRegistry<V>,
    gc_at: Option<Instant>,
    /// Whether a collection timer task exists for this entry. There is at most one, it
    /// follows `gc_at` as it moves.
    gc_timer: bool,
    start_gc_timer: Option<Instant>,

    events: VecDeque<CacheEvent<V>>,
    draining: bool,
}

impl<V: Send + Sync + 'static> Entry<V> {
    /// Creates an idle entry. Nobody observes it yet, so its collection is armed right away.
    pub fn new(key: QueryKey, config: EntryConfig, now: Instant) -> Self {
        let mut state = EntryState {
            value: None,
            status: FetchStatus::Idle,
            status_before_fetch: FetchStatus::Idle,
            fetched_at: None,
            updated_at: None,
            error: None,
            failure_count: 0,
            invalidated: false,
            invalidated_before: 0,
            config,
            fetcher: None,
            fetching: None,
            last_fetch_seq: None,
            observers: ObserverRegistry::default(),
            gc_at: None,
            gc_timer: false,
            start_gc_timer: None,
            events: VecDeque::new(),
            draining: false,
        };
        state.arm_gc(now);
        Self {
            key,
            state: Mutex::new(state),
        }
    }

    /// Delivers queued events to the observers, in the order they were queued.
    ///
    /// Only one caller drains at a time. Others return immediately and their events are
    /// delivered by the active drainer. No lock is held while observers run.
    pub fn notify(&self) {
        {
            let mut state = self.state.lock();
            if state.draining || state.events.is_empty() {
                return;
            }
            state.draining = true;
        }
        let _guard = DrainGuard(self);

        loop {
            let (event, observers) = {
                let mut state = self.state.lock();
                match state.events.pop_front() {
                    Some(event) => (event, state.observers.snapshot()),
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            for observer in observers {
                observer.on_event(&self.key, &event);
            }
        }
    }
}

/// Releases the drainer role when an observer panics, so later events are still delivered.
struct DrainGuard<'a, V>(&'a Entry<V>);

impl<V> Drop for DrainGuard<'_, V> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.state.lock().draining = false;
        }
    }
}

impl<V: Send + Sync + 'static> EntryState<V> {
    /// The status as readers see it, with elapsed freshness taken into account.
    pub fn status(&self, now: Instant) -> FetchStatus {
        match self.status {
            FetchStatus::Fresh if self.is_stale(now) => FetchStatus::Stale,
            status => status,
        }
    }

    /// Whether the value should be refetched.
    pub fn is_stale(&self, now: Instant) -> bool {
        if self.value.is_none() || self.invalidated {
            return true;
        }
        match self.stale_at() {
            Some(stale_at) => now >= stale_at,
            None => self.fetched_at.is_none(),
        }
    }

    pub fn stale_at(&self) -> Option<Instant> {
        Some(self.fetched_at? + self.config.stale_time?)
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.count()
    }

    pub fn has_observers(&self) -> bool {
        !self.observers.is_empty()
    }

    pub fn snapshot(&self, key: &QueryKey, now: Instant) -> EntrySnapshot<V> {
        EntrySnapshot {
            key: key.clone(),
            value: self.value.clone(),
            status: self.status(now),
            updated_at: self.updated_at,
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            stale_at: self.stale_at(),
            gc_at: self.gc_at,
            observers: self.observers.count(),
            is_fetching: self.is_fetching(),
            failure_count: self.failure_count,
        }
    }

    /// Registers an observer, disarming garbage collection on the first one.
    pub fn subscribe(&mut self, id: ObserverId, observer: Arc<dyn Notifiable<V>>) {
        if self.observers.subscribe(id, observer) {
            self.disarm_gc();
        }
    }

    /// Removes an observer, arming garbage collection when it was the last one.
    ///
    /// Returns `false` if the observer was not registered.
    pub fn unsubscribe(&mut self, id: ObserverId, now: Instant) -> bool {
        match self.observers.unsubscribe(id) {
            Some(0) => {
                self.arm_gc(now);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Starts the collection countdown. A `gc_time` of `None` keeps the entry forever.
    ///
    /// A timer is only requested when none is running, a running one picks up the new
    /// deadline when it wakes up.
    pub fn arm_gc(&mut self, now: Instant) {
        self.gc_at = self.config.gc_time.map(|gc_time| now + gc_time);
        if let (Some(deadline), false) = (self.gc_at, self.gc_timer) {
            self.gc_timer = true;
            self.start_gc_timer = Some(deadline);
        }
    }

    fn disarm_gc(&mut self) {
        self.gc_at = None;
    }

    /// Pushes the collection deadline out after a write to an unobserved entry.
    fn touch_gc(&mut self, now: Instant) {
        if self.observers.is_empty() {
            self.arm_gc(now);
        }
    }

    /// Takes the deadline of a timer to start once the lock is released.
    pub fn take_gc_timer(&mut self) -> Option<Instant> {
        self.start_gc_timer.take()
    }

    /// Called by the collection timer when it wakes up at `now`.
    pub fn poll_gc(&mut self, now: Instant) -> GcStep {
        let step = match self.gc_at {
            Some(gc_at) if gc_at > now => GcStep::Sleep(gc_at),
            // Finishing the fetch arms the timer again. With a delay, check back later.
            Some(_) if self.is_fetching() => match self.config.gc_time {
                Some(gc_time) if !gc_time.is_zero() => {
                    self.gc_at = Some(now + gc_time);
                    GcStep::Sleep(now + gc_time)
                }
                _ => GcStep::Stop,
            },
            Some(_) if self.observers.is_empty() => GcStep::Collect,
            _ => GcStep::Stop,
        };
        if !matches!(step, GcStep::Sleep(_)) {
            self.gc_timer = false;
        }
        step
    }

    /// Forgets the timer of an entry that left the map, or whose timer could not be spawned.
    pub fn stop_gc_timer(&mut self) {
        self.gc_timer = false;
    }

    /// Whether the entry may be removed by the collector.
    pub fn is_collectable(&self, now: Instant) -> bool {
        self.observers.is_empty() && self.gc_at.is_some_and(|gc_at| gc_at <= now)
    }

    /// Writes a value, keeping the current `Arc` if it is structurally equal.
    ///
    /// Returns the value now stored and whether it changed. Observers are only notified of
    /// changes.
    pub fn write(
        &mut self,
        value: V,
        comparator: &dyn StructuralComparator<V>,
        now: Instant,
    ) -> (Arc<V>, bool) {
        let (value, changed) = if self.config.structural_sharing {
            share_structure(comparator, self.value.as_ref(), value)
        } else {
            (Arc::new(value), true)
        };

        self.status = FetchStatus::Fresh;
        self.status_before_fetch = FetchStatus::Fresh;
        self.fetched_at = Some(now);
        self.error = None;
        self.failure_count = 0;
        if changed {
            self.value = Some(Arc::clone(&value));
            self.updated_at = Some(SystemTime::now());
            self.events
                .push_back(CacheEvent::Updated(Some(Arc::clone(&value))));
        }
        self.touch_gc(now);
        (value, changed)
    }

    /// A direct write also counts as revalidation.
    pub fn set(
        &mut self,
        value: V,
        comparator: &dyn StructuralComparator<V>,
        now: Instant,
    ) -> (Arc<V>, bool) {
        self.invalidated = false;
        self.write(value, comparator, now)
    }

    /// Seeds the entry with a value produced elsewhere at `updated_at`.
    ///
    /// Older data than what the entry already holds is ignored.
    pub fn hydrate(
        &mut self,
        value: V,
        updated_at: SystemTime,
        comparator: &dyn StructuralComparator<V>,
        now: Instant,
    ) -> bool {
        if self.updated_at.is_some_and(|current| current >= updated_at) {
            return false;
        }
        let age = SystemTime::now()
            .duration_since(updated_at)
            .unwrap_or_default();
        let (_, changed) = self.write(value, comparator, now);
        self.fetched_at = Some(now.checked_sub(age).unwrap_or(now));
        self.updated_at = Some(updated_at);
        changed
    }

    pub fn invalidate(&mut self, next_seq: u64) {
        self.invalidated = true;
        self.invalidated_before = next_seq;
    }

    pub fn begin_fetch(&mut self, seq: u64) {
        if self.status != FetchStatus::Pending {
            self.status_before_fetch = self.status;
        }
        self.status = FetchStatus::Pending;
        self.fetching = Some(seq);
    }

    /// Reverts the status of a cancelled fetch.
    pub fn abort_fetch(&mut self, seq: u64, now: Instant) {
        if self.fetching == Some(seq) {
            self.fetching = None;
            if self.status == FetchStatus::Pending {
                self.status = self.status_before_fetch;
            }
            self.touch_gc(now);
        }
    }

    /// Commits a finished fetch and returns what its callers receive.
    pub fn complete_fetch(
        &mut self,
        key: &QueryKey,
        seq: u64,
        result: CacheResult<V>,
        comparator: &dyn StructuralComparator<V>,
        now: Instant,
    ) -> CacheResult<Arc<V>> {
        if matches!(result, Err(CacheError::Cancelled)) {
            self.abort_fetch(seq, now);
            return Err(CacheError::Cancelled);
        }
        if self.fetching == Some(seq) {
            self.fetching = None;
        }
        if self.last_fetch_seq.is_some_and(|last| seq < last) {
            metric!(counter("caches.fetch.discarded") += 1);
            tracing::debug!(%key, seq, "Discarding outdated fetch result");
            return result.map(Arc::new);
        }
        self.last_fetch_seq = Some(seq);

        match result {
            Ok(value) => {
                if seq >= self.invalidated_before {
                    self.invalidated = false;
                }
                let (value, changed) = self.write(value, comparator, now);
                if !changed {
                    metric!(counter("caches.set.unchanged") += 1);
                }
                Ok(value)
            }
            Err(error) => {
                metric!(counter("caches.fetch.failed") += 1, "error" => error.metrics_tag());
                tracing::warn!(%key, %error, "Fetch failed");
                if self.status == FetchStatus::Pending {
                    self.status = FetchStatus::Error;
                }
                self.error = Some(error.clone());
                self.failure_count += 1;
                self.events.push_back(CacheEvent::Failed(error.clone()));
                self.touch_gc(now);
                Err(error)
            }
        }
    }

    pub fn save(&self) -> SavedEntry<V> {
        let status = match self.status {
            FetchStatus::Pending => self.status_before_fetch,
            status => status,
        };
        SavedEntry {
            value: self.value.clone(),
            status,
            fetched_at: self.fetched_at,
            updated_at: self.updated_at,
            error: self.error.clone(),
        }
    }

    /// Puts back a saved state, notifying observers if the value differs.
    pub fn restore(&mut self, saved: SavedEntry<V>, now: Instant) {
        let changed = match (&self.value, &saved.value) {
            (Some(current), Some(saved)) => !Arc::ptr_eq(current, saved),
            (None, None) => false,
            _ => true,
        };
        if changed {
            self.events.push_back(CacheEvent::Updated(saved.value.clone()));
        }
        self.value = saved.value;
        self.status = saved.status;
        self.status_before_fetch = saved.status;
        self.fetched_at = saved.fetched_at;
        self.updated_at = saved.updated_at;
        self.error = saved.error;
        self.touch_gc(now);
    }
}
