//! Observers and their registration on cache entries.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::UnboundedSender;

use crate::error::CacheError;
use crate::key::QueryKey;

/// A change delivered to the observers of an entry.
#[derive(Debug)]
pub enum CacheEvent<V> {
    /// The value of the entry changed. `None` means the entry lost its value, which only
    /// happens when a mutation is rolled back to a state without data.
    Updated(Option<Arc<V>>),
    /// A fetch for the entry failed. The previous value is kept.
    Failed(CacheError),
}

impl<V> Clone for CacheEvent<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Updated(value) => Self::Updated(value.clone()),
            Self::Failed(error) => Self::Failed(error.clone()),
        }
    }
}

impl<V> CacheEvent<V> {
    /// The new value, if this is an update carrying one.
    pub fn value(&self) -> Option<&Arc<V>> {
        match self {
            Self::Updated(value) => value.as_ref(),
            Self::Failed(_) => None,
        }
    }
}

/// Something that wants to hear about changes to a cache entry.
///
/// Callbacks run on whichever task wrote the change, outside of any cache lock, so they may
/// call back into the cache. They should be quick and must not block.
pub trait Notifiable<V>: Send + Sync + 'static {
    fn on_event(&self, key: &QueryKey, event: &CacheEvent<V>);
}

impl<V, F> Notifiable<V> for F
where
    F: Fn(&QueryKey, &CacheEvent<V>) + Send + Sync + 'static,
{
    fn on_event(&self, key: &QueryKey, event: &CacheEvent<V>) {
        self(key, event)
    }
}

impl<V: Send + Sync + 'static> Notifiable<V> for UnboundedSender<(QueryKey, CacheEvent<V>)> {
    fn on_event(&self, key: &QueryKey, event: &CacheEvent<V>) {
        // A closed receiver just means nobody listens anymore.
        self.send((key.clone(), event.clone())).ok();
    }
}

/// Identifies a single subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl ObserverId {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// The observers registered on one entry, in subscription order.
pub(crate) struct ObserverRegistry<V> {
    observers: Vec<(ObserverId, Arc<dyn Notifiable<V>>)>,
}

impl<V: 'static> Default for ObserverRegistry<V> {
    fn default() -> Self {
        Self {
            observers: Vec::new(),
        }
    }
}

impl<V: 'static> ObserverRegistry<V> {
    /// Registers an observer. Returns `true` if this is the first one.
    pub fn subscribe(&mut self, id: ObserverId, observer: Arc<dyn Notifiable<V>>) -> bool {
        let was_empty = self.observers.is_empty();
        match self.observers.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => slot.1 = observer,
            None => self.observers.push((id, observer)),
        }
        was_empty
    }

    /// Removes an observer and returns how many remain, or `None` if it was not registered.
    pub fn unsubscribe(&mut self, id: ObserverId) -> Option<usize> {
        let index = self.observers.iter().position(|(existing, _)| *existing == id)?;
        self.observers.remove(index);
        Some(self.observers.len())
    }

    pub fn count(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// The current observers, for delivery outside of the entry lock.
    pub fn snapshot(&self) -> Vec<Arc<dyn Notifiable<V>>> {
        self.observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }
}
