use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use revalidator_cache::{
    CacheError, CacheResult, CacheStore, FetchStatus, MutationController, MutationMode,
    MutationRequest, QueryKey, query_key,
};

use crate::{CountingFetcher, LATENCY, RecordingObserver, cached, setup_config};

/// Adds the payload to `["counter"]`, answering after one second.
struct Increment {
    fail: bool,
}

impl MutationRequest<i64> for Increment {
    type Payload = i64;
    type Output = ();

    fn affected_keys(&self, _delta: &i64) -> Vec<QueryKey> {
        vec![query_key!["counter"]]
    }

    fn optimistic_value(&self, _key: &QueryKey, current: Option<&i64>, delta: &i64) -> Option<i64> {
        current.map(|current| current + delta)
    }

    fn execute<'a>(&'a self, _delta: &'a i64) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match self.fail {
                true => Err(CacheError::fetch("conflict")),
                false => Ok(()),
            }
        })
    }
}

/// Renames a profile, only touching the cache once the server answered.
struct Rename {
    fail: bool,
}

impl MutationRequest<String> for Rename {
    type Payload = String;
    type Output = String;

    fn mode(&self) -> MutationMode {
        MutationMode::Pessimistic
    }

    fn validate(&self, name: &String) -> CacheResult<()> {
        if name.trim().is_empty() {
            return Err(CacheError::Validation("name must not be empty".into()));
        }
        Ok(())
    }

    fn affected_keys(&self, _name: &String) -> Vec<QueryKey> {
        vec![query_key!["profile"], query_key!["profiles", "list"]]
    }

    fn execute<'a>(&'a self, name: &'a String) -> BoxFuture<'a, CacheResult<String>> {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match self.fail {
                true => Err(CacheError::fetch("unavailable")),
                false => Ok(name.to_uppercase()),
            }
        })
    }

    fn confirmed_value(
        &self,
        key: &QueryKey,
        _current: Option<&String>,
        output: &String,
    ) -> Option<String> {
        (key == &query_key!["profile"]).then(|| output.clone())
    }
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_failure_rolls_back() {
    let config = setup_config(|c| c.stale_time = None);
    let fetcher = CountingFetcher::<i64>::new(LATENCY, |_, _| Ok(7));
    let store = CacheStore::with_fetcher(config, fetcher.clone());
    let key = query_key!["counter"];
    store.set(key.clone(), 5);
    let before = store.peek(&key).unwrap().value.unwrap();

    let controller = MutationController::new(store.clone());
    let request = Increment { fail: true };
    let mutation = controller.mutate(&request, 1);
    futures::pin_mut!(mutation);

    // Applied right away, before the server answered.
    assert!(futures::poll!(mutation.as_mut()).is_pending());
    assert_eq!(cached(&store, &key), Some(6));

    assert_eq!(mutation.await, Err(CacheError::Fetch("conflict".into())));
    let snapshot = store.peek(&key).unwrap();
    assert!(Arc::ptr_eq(snapshot.value.as_ref().unwrap(), &before));
    assert_eq!(snapshot.status, FetchStatus::Stale);
    assert_eq!(fetcher.calls(), 0);

    // The rollback is settled by a real refetch on next use.
    let snapshot = store.get(&key).unwrap();
    assert_eq!(snapshot.value.as_deref(), Some(&5));
    assert!(store.is_fetching(&key));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(cached(&store, &key), Some(7));
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_success_refetches_observed() {
    let config = setup_config(|c| c.stale_time = None);
    let fetcher = CountingFetcher::new(LATENCY, |_, _| Ok(6));
    let store = CacheStore::<i64>::with_fetcher(config, fetcher.clone());
    let key = query_key!["counter"];
    store.set(key.clone(), 5);
    let observer = RecordingObserver::new();
    let _subscription = store.subscribe(key.clone(), observer.clone());

    let controller = MutationController::new(store.clone());
    controller.mutate(&Increment { fail: false }, 1).await.unwrap();
    assert!(store.is_fetching(&key));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(store.peek(&key).unwrap().status, FetchStatus::Fresh);
    // The server agrees with the optimistic value, so there is no second update.
    insta::assert_snapshot!(observer.describe(), @"updated: 6");
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_mutation_cancels_fetch() {
    let config = setup_config(|c| c.stale_time = None);
    let fetcher = CountingFetcher::<i64>::new(LATENCY * 50, |_, _| Ok(100));
    let store = CacheStore::<i64>::new(config);
    let key = query_key!["counter"];
    store.set(key.clone(), 5);

    let running = store.fetch(&key, fetcher.clone());
    crate::settle().await;

    let controller = MutationController::new(store.clone());
    controller.mutate(&Increment { fail: false }, 1).await.unwrap();

    // The older fetch would otherwise overwrite the optimistic value.
    assert_eq!(running.await, Err(CacheError::Cancelled));
    assert!(fetcher.token(1).unwrap().is_cancelled());
    assert_eq!(cached(&store, &key), Some(6));
}

#[tokio::test(start_paused = true)]
async fn test_pessimistic_mutation() {
    let config = setup_config(|c| c.stale_time = None);
    let store = CacheStore::<String>::new(config);
    let key = query_key!["profile"];
    store.set(key.clone(), "jane".to_owned());
    let observer = RecordingObserver::new();
    let _subscription = store.subscribe(key.clone(), observer.clone());

    let controller = MutationController::new(store.clone());
    let request = Rename { fail: false };
    let mutation = controller.mutate(&request, "joan".to_owned());
    futures::pin_mut!(mutation);

    // Nothing changes before the server answered.
    assert!(futures::poll!(mutation.as_mut()).is_pending());
    assert_eq!(cached(&store, &key).unwrap(), "jane");

    assert_eq!(mutation.await.unwrap(), "JOAN");
    assert_eq!(cached(&store, &key).unwrap(), "JOAN");
    assert_eq!(store.peek(&key).unwrap().status, FetchStatus::Stale);
    insta::assert_snapshot!(observer.describe(), @r#"updated: "JOAN""#);
}

#[tokio::test(start_paused = true)]
async fn test_pessimistic_failure() {
    let config = setup_config(|c| c.stale_time = None);
    let store = CacheStore::<String>::new(config);
    let key = query_key!["profile"];
    store.set(key.clone(), "jane".to_owned());
    let observer = RecordingObserver::new();
    let _subscription = store.subscribe(key.clone(), observer.clone());

    let controller = MutationController::new(store.clone());
    let result = controller
        .mutate(&Rename { fail: true }, "joan".to_owned())
        .await;

    assert_eq!(result, Err(CacheError::Fetch("unavailable".into())));
    assert_eq!(cached(&store, &key).unwrap(), "jane");
    assert_eq!(observer.count(), 0);
    // Settling happens regardless of the outcome.
    assert_eq!(store.peek(&key).unwrap().status, FetchStatus::Stale);
}

#[tokio::test]
async fn test_invalid_payload() {
    let config = setup_config(|c| c.stale_time = None);
    let store = CacheStore::<String>::new(config);
    let key = query_key!["profile"];
    store.set(key.clone(), "jane".to_owned());

    let controller = MutationController::new(store.clone());
    let result = controller.mutate(&Rename { fail: false }, "  ".to_owned()).await;

    assert!(matches!(result, Err(CacheError::Validation(_))));
    assert_eq!(store.peek(&key).unwrap().status, FetchStatus::Fresh);
}
