//! Optimistic and pessimistic mutations of cached data.
//!
//! An optimistic mutation writes its expected result into the cache before the server call,
//! so observers see the change immediately. When the call fails, every affected key is rolled
//! back to the snapshot taken before the write. Either way, the affected keys are invalidated
//! once the call finished, so the cache converges on the server's state.
//!
//! Pessimistic mutations only touch the cache after the server confirmed the change. They fit
//! operations where a wrong intermediate state is costly: server-side validation, batches
//! spanning many items, or audit-logged changes. Optimistic mutations fit quick, reversible
//! changes like toggles.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;

use crate::entry::SavedEntry;
use crate::error::CacheResult;
use crate::key::QueryKey;
use crate::store::CacheStore;

/// When a mutation writes to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationMode {
    /// Write before the server call, roll back on failure.
    #[default]
    Optimistic,
    /// Write only after the server call succeeded.
    Pessimistic,
}

/// The steps of a mutation, as they appear in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Start,
    Snapshot,
    OptimisticApply,
    ServerSuccess,
    ServerFailure,
    Settle,
}

/// A change to server-side data that is mirrored in the cache.
pub trait MutationRequest<V>: Send + Sync {
    type Payload: Send + Sync;
    type Output: Send;

    fn mode(&self) -> MutationMode {
        MutationMode::Optimistic
    }

    /// Checks the payload before anything is written or cancelled.
    fn validate(&self, _payload: &Self::Payload) -> CacheResult<()> {
        Ok(())
    }

    /// The keys whose data this mutation changes.
    fn affected_keys(&self, payload: &Self::Payload) -> Vec<QueryKey>;

    /// The value `key` is expected to have after the mutation. `None` leaves it untouched.
    fn optimistic_value(
        &self,
        _key: &QueryKey,
        _current: Option<&V>,
        _payload: &Self::Payload,
    ) -> Option<V> {
        None
    }

    /// Performs the server call.
    fn execute<'a>(&'a self, payload: &'a Self::Payload) -> BoxFuture<'a, CacheResult<Self::Output>>;

    /// The value `key` has after a successful pessimistic mutation. `None` leaves it to the
    /// refetch after settling.
    fn confirmed_value(
        &self,
        _key: &QueryKey,
        _current: Option<&V>,
        _output: &Self::Output,
    ) -> Option<V> {
        None
    }
}

/// The state of every affected key before an optimistic write.
struct MutationSnapshot<V> {
    entries: Vec<(QueryKey, SavedEntry<V>)>,
}

impl<V: Send + Sync + 'static> MutationSnapshot<V> {
    fn capture(store: &CacheStore<V>, keys: &[QueryKey]) -> Self {
        let entries = keys
            .iter()
            .map(|key| (key.clone(), store.save_entry(key)))
            .collect();
        Self { entries }
    }

    /// Puts back every key, including the absence of a value.
    fn restore(self, store: &CacheStore<V>) {
        for (key, saved) in self.entries {
            store.restore_entry(&key, saved);
        }
    }
}

/// Settles a mutation when dropped, rolling back unless the server confirmed it.
///
/// Dropping it before [`finish`](Self::finish) covers mutations whose future was dropped
/// while waiting for the server.
struct PendingMutation<'a, V: Send + Sync + 'static> {
    id: u64,
    store: &'a CacheStore<V>,
    keys: &'a [QueryKey],
    snapshot: Option<MutationSnapshot<V>>,
    answered: bool,
}

impl<V: Send + Sync + 'static> PendingMutation<'_, V> {
    fn finish(mut self, succeeded: bool) {
        self.answered = true;
        if succeeded {
            tracing::debug!(mutation = self.id, phase = ?MutationPhase::ServerSuccess);
            self.snapshot = None;
        } else {
            tracing::debug!(mutation = self.id, phase = ?MutationPhase::ServerFailure);
        }
    }
}

impl<V: Send + Sync + 'static> Drop for PendingMutation<'_, V> {
    fn drop(&mut self) {
        if !self.answered {
            tracing::debug!(mutation = self.id, "Mutation abandoned before the server answered");
        }
        if let Some(snapshot) = self.snapshot.take() {
            rollback(self.store, snapshot);
        }
        settle(self.id, self.store, self.keys);
    }
}

fn rollback<V: Send + Sync + 'static>(store: &CacheStore<V>, snapshot: MutationSnapshot<V>) {
    metric!(counter("mutations.rollback") += 1);
    snapshot.restore(store);
}

fn settle<V: Send + Sync + 'static>(id: u64, store: &CacheStore<V>, keys: &[QueryKey]) {
    tracing::debug!(mutation = id, phase = ?MutationPhase::Settle);
    metric!(counter("mutations.settle") += 1);
    // Keys may have been collected while the server call ran.
    for key in keys {
        store.invalidate_matching(|candidate| candidate.matches(key));
    }
}

/// Runs [`MutationRequest`]s against a [`CacheStore`].
#[derive(Debug)]
pub struct MutationController<V: Send + Sync + 'static> {
    store: CacheStore<V>,
    next_id: AtomicU64,
}

impl<V: Send + Sync + 'static> MutationController<V> {
    pub fn new(store: CacheStore<V>) -> Self {
        Self {
            store,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &CacheStore<V> {
        &self.store
    }

    /// Runs `request` with `payload` and returns the server's answer.
    ///
    /// Validation errors are returned before the cache is touched. Server errors are returned
    /// after the cache was rolled back. Every affected key is invalidated once the server
    /// answered, whatever the outcome. No lock is held during the server call.
    pub async fn mutate<M: MutationRequest<V>>(
        &self,
        request: &M,
        payload: M::Payload,
    ) -> CacheResult<M::Output> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let keys = request.affected_keys(&payload);
        let mode = request.mode();
        tracing::debug!(mutation = id, phase = ?MutationPhase::Start, ?mode, keys = keys.len());

        if let Err(error) = request.validate(&payload) {
            tracing::debug!(mutation = id, %error, "Mutation rejected");
            return Err(error);
        }

        match mode {
            MutationMode::Optimistic => self.mutate_optimistic(id, request, &keys, payload).await,
            MutationMode::Pessimistic => self.mutate_pessimistic(id, request, &keys, payload).await,
        }
    }

    async fn mutate_optimistic<M: MutationRequest<V>>(
        &self,
        id: u64,
        request: &M,
        keys: &[QueryKey],
        payload: M::Payload,
    ) -> CacheResult<M::Output> {
        tracing::debug!(mutation = id, phase = ?MutationPhase::Snapshot);
        let snapshot = MutationSnapshot::capture(&self.store, keys);
        for key in keys {
            self.store.cancel(key);
        }

        tracing::debug!(mutation = id, phase = ?MutationPhase::OptimisticApply);
        for key in keys {
            let current = self.store.peek(key).and_then(|snapshot| snapshot.value);
            if let Some(value) = request.optimistic_value(key, current.as_deref(), &payload) {
                self.store.set(key.clone(), value);
            }
        }

        let pending = PendingMutation {
            id,
            store: &self.store,
            keys,
            snapshot: Some(snapshot),
            answered: false,
        };
        let result = request.execute(&payload).await;
        pending.finish(result.is_ok());
        result
    }

    async fn mutate_pessimistic<M: MutationRequest<V>>(
        &self,
        id: u64,
        request: &M,
        keys: &[QueryKey],
        payload: M::Payload,
    ) -> CacheResult<M::Output> {
        let pending = PendingMutation {
            id,
            store: &self.store,
            keys,
            snapshot: None,
            answered: false,
        };
        let result = request.execute(&payload).await;
        if let Ok(output) = &result {
            for key in keys {
                let current = self.store.peek(key).and_then(|snapshot| snapshot.value);
                if let Some(value) = request.confirmed_value(key, current.as_deref(), output) {
                    self.store.set(key.clone(), value);
                }
            }
        }
        pending.finish(result.is_ok());
        result
    }
}
