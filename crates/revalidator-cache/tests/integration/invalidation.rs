use std::time::Duration;

use revalidator_cache::{CacheError, CacheStore, FetchStatus, QueryKey, query_key};

use crate::{RecordingObserver, cached, numbered_fetcher, settle, setup_config};

fn status(store: &CacheStore<String>, key: &QueryKey) -> FetchStatus {
    store.peek(key).unwrap().status
}

#[tokio::test]
async fn test_invalidate_prefix() {
    let config = setup_config(|c| c.stale_time = None);
    let store = CacheStore::<String>::new(config);
    let keys = [
        query_key!["a"],
        query_key!["a", "b"],
        query_key!["a", "b", "c"],
        query_key!["b"],
    ];
    for key in &keys {
        store.set(key.clone(), key.to_string());
    }

    assert_eq!(store.invalidate(&query_key!["a"]), 3);
    assert_eq!(status(&store, &keys[0]), FetchStatus::Stale);
    assert_eq!(status(&store, &keys[1]), FetchStatus::Stale);
    assert_eq!(status(&store, &keys[2]), FetchStatus::Stale);
    assert_eq!(status(&store, &keys[3]), FetchStatus::Fresh);

    // Invalidated entries keep their value.
    assert_eq!(cached(&store, &keys[1]).unwrap(), r#"["a","b"]"#);

    // Writing revalidates.
    store.set(keys[0].clone(), "new".into());
    assert_eq!(status(&store, &keys[0]), FetchStatus::Fresh);
}

#[tokio::test]
async fn test_invalidate_matches_whole_segments() {
    let config = setup_config(|c| c.stale_time = None);
    let store = CacheStore::<String>::new(config);
    store.set(query_key!["a"], "a".into());
    store.set(query_key!["a", "b"], "ab".into());
    store.set(query_key!["ab"], "ab".into());
    store.set(query_key!["a", 1], "a1".into());

    assert_eq!(store.invalidate(&query_key!["a", "b"]), 1);
    assert_eq!(status(&store, &query_key!["a", 1]), FetchStatus::Fresh);
    assert_eq!(store.invalidate(&query_key!["a", 1]), 1);
    assert_eq!(status(&store, &query_key!["a"]), FetchStatus::Fresh);
    assert_eq!(status(&store, &query_key!["ab"]), FetchStatus::Fresh);
}

#[tokio::test]
async fn test_invalidate_all() {
    let config = setup_config(|_| {});
    let store = CacheStore::<String>::new(config);
    assert_eq!(store.invalidate_all(), 0);

    store.set(query_key!["a"], "a".into());
    store.set(query_key!["b"], "b".into());
    assert_eq!(store.invalidate_all(), 2);
    assert_eq!(status(&store, &query_key!["b"]), FetchStatus::Stale);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "matches no entry")]
fn test_invalidate_unknown_prefix() {
    let config = setup_config(|_| {});
    let store = CacheStore::<String>::new(config);
    store.set(query_key!["a", "1"], "a1".into());
    store.invalidate(&query_key!["a", "2"]);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_refetches_observed() {
    let config = setup_config(|c| c.stale_time = None);
    let fetcher = numbered_fetcher();
    let store = CacheStore::<String>::new(config);
    let observed = query_key!["todos", 1];
    let unobserved = query_key!["todos", 2];
    let observer = RecordingObserver::new();
    let _subscription = store.subscribe(observed.clone(), observer.clone());

    store.query(&observed, fetcher.clone()).await.unwrap();
    store.query(&unobserved, fetcher.clone()).await.unwrap();
    assert_eq!(fetcher.calls(), 2);

    assert_eq!(store.invalidate(&query_key!["todos"]), 2);
    assert!(store.is_fetching(&observed));
    assert!(!store.is_fetching(&unobserved));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fetcher.calls(), 3);
    assert_eq!(status(&store, &observed), FetchStatus::Fresh);
    assert_eq!(status(&store, &unobserved), FetchStatus::Stale);
    assert_eq!(
        cached(&store, &observed).unwrap(),
        r#"["todos",1] #3"#
    );
    assert_eq!(observer.values().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_replaces_running_fetch() {
    let config = setup_config(|c| c.stale_time = None);
    let fetcher = numbered_fetcher();
    let store = CacheStore::<String>::new(config);
    let key = query_key!["x"];
    let observer = RecordingObserver::new();
    let _subscription = store.subscribe(key.clone(), observer.clone());

    let outdated = store.fetch(&key, fetcher.clone());
    settle().await;
    store.invalidate(&key);
    assert!(fetcher.token(1).unwrap().is_cancelled());

    // Whoever waited for the cancelled fetch gets the data fetched after the invalidation.
    let value = outdated.await.unwrap();
    assert_eq!(value.as_str(), r#"["x"] #2"#);
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(cached(&store, &key).unwrap(), r#"["x"] #2"#);
    assert_eq!(status(&store, &key), FetchStatus::Fresh);
    assert_eq!(observer.values().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pending_query_survives_invalidation() {
    let config = setup_config(|c| c.stale_time = None);
    let fetcher = numbered_fetcher();
    let store = CacheStore::<String>::new(config);
    let key = query_key!["x"];
    let _subscription = store.subscribe(key.clone(), RecordingObserver::new());

    let query = tokio::spawn({
        let store = store.clone();
        let key = key.clone();
        let fetcher = fetcher.clone();
        async move { store.query(&key, fetcher).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(store.is_fetching(&key));
    assert_eq!(store.invalidate(&key), 1);

    let value = query.await.unwrap().unwrap();
    assert_eq!(value.as_str(), r#"["x"] #2"#);
    assert_eq!(fetcher.calls(), 2);
    assert!(!store.is_fetching(&key));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reaches_callers() {
    let config = setup_config(|c| c.stale_time = None);
    let fetcher = numbered_fetcher();
    let store = CacheStore::<String>::new(config);
    let key = query_key!["x"];

    let running = store.fetch(&key, fetcher.clone());
    settle().await;
    assert!(store.cancel(&key));
    assert_eq!(running.await, Err(CacheError::Cancelled));
    assert_eq!(status(&store, &key), FetchStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_started_before_invalidation_stays_stale() {
    let config = setup_config(|c| c.stale_time = None);
    let fetcher = numbered_fetcher();
    let store = CacheStore::<String>::new(config);
    let key = query_key!["x"];

    let running = store.fetch(&key, fetcher.clone());
    settle().await;
    store.invalidate(&key);

    // Nobody observes the entry, so the running fetch is kept. Its data may predate the
    // invalidation, the entry stays stale.
    let value = running.await.unwrap();
    assert_eq!(value.as_str(), r#"["x"] #1"#);
    assert_eq!(status(&store, &key), FetchStatus::Stale);

    // The next fetch started after the invalidation revalidates.
    store.refetch(&key).await.unwrap();
    assert_eq!(status(&store, &key), FetchStatus::Fresh);
}

#[tokio::test]
async fn test_remove_and_clear() {
    let config = setup_config(|_| {});
    let store = CacheStore::<i32>::new(config);
    let observed = query_key!["observed"];
    let unobserved = query_key!["unobserved"];
    let subscription = store.subscribe(observed.clone(), RecordingObserver::new());
    store.set(observed.clone(), 1);
    store.set(unobserved.clone(), 2);

    assert!(!store.remove(&observed));
    assert_eq!(cached(&store, &observed), Some(1));

    assert_eq!(store.clear(), 1);
    assert!(store.peek(&unobserved).is_none());
    assert_eq!(store.len(), 1);

    drop(subscription);
    assert!(store.remove(&observed));
    assert!(!store.remove(&observed));
    assert!(store.is_empty());
}
