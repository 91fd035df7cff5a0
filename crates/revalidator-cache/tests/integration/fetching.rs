use std::sync::Arc;
use std::time::Duration;

use revalidator_cache::{
    CacheError, CacheStore, FetchCoordinator, FetchStatus, JsonComparator, query_key,
};
use serde_json::json;
use tokio::time::Instant;

use crate::{
    CountingFetcher, LATENCY, RecordingObserver, cached, numbered_fetcher, settle, setup_config,
};

#[tokio::test(start_paused = true)]
async fn test_stale_while_revalidate() {
    let config = setup_config(|c| c.stale_time = Some(Duration::from_secs(5)));
    let fetcher = numbered_fetcher();
    let store = CacheStore::with_fetcher(config, fetcher.clone());
    let key = query_key!["x"];

    let first = store.query_known(&key).await.unwrap();
    assert_eq!(first.as_str(), r#"["x"] #1"#);

    // Still fresh: served from memory without a fetch.
    let snapshot = store.get(&key).unwrap();
    assert_eq!(snapshot.status, FetchStatus::Fresh);
    assert!(Arc::ptr_eq(snapshot.value.as_ref().unwrap(), &first));
    settle().await;
    assert_eq!(fetcher.calls(), 1);
    assert!(!store.is_fetching(&key));

    // Stale: the cached value is returned right away and a refetch starts in the background.
    tokio::time::advance(Duration::from_secs(6)).await;
    let snapshot = store.get(&key).unwrap();
    assert_eq!(snapshot.status, FetchStatus::Stale);
    assert!(Arc::ptr_eq(snapshot.value.as_ref().unwrap(), &first));
    assert!(store.is_fetching(&key));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fetcher.calls(), 2);
    let snapshot = store.peek(&key).unwrap();
    assert_eq!(snapshot.status, FetchStatus::Fresh);
    assert_eq!(
        snapshot.value.as_deref().map(String::as_str),
        Some(r#"["x"] #2"#)
    );
}

#[tokio::test(start_paused = true)]
async fn test_query_serves_stale_value() {
    let config = setup_config(|c| c.stale_time = Some(Duration::ZERO));
    let fetcher = numbered_fetcher();
    let store = CacheStore::<String>::new(config);
    let key = query_key!["x"];

    let first = store.query(&key, fetcher.clone()).await.unwrap();
    let second = store.query(&key, fetcher.clone()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(cached(&store, &key).unwrap(), r#"["x"] #2"#);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_queries_fetch_once() {
    let config = setup_config(|_| {});
    let fetcher = numbered_fetcher();
    let store = CacheStore::<String>::new(config);
    let key = query_key!["user", "42"];

    let (a, b, c) = tokio::join!(
        store.query(&key, fetcher.clone()),
        store.query(&key, fetcher.clone()),
        store.query(&key, fetcher.clone()),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert_eq!(fetcher.calls(), 1);
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
    assert!(!store.is_fetching(&key));
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_deduplicates_requests() {
    revalidator_test::setup();
    let fetcher = numbered_fetcher();
    let coordinator = FetchCoordinator::<String>::new();
    let key = query_key!["user", "42"];

    let first = coordinator.request(key.clone(), fetcher.clone());
    let second = coordinator.request(key.clone(), fetcher.clone());
    assert!(coordinator.is_in_flight(&key));
    assert_eq!(coordinator.in_flight_count(), 1);

    let (first, second) = tokio::join!(first, second);
    assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    assert_eq!(fetcher.calls(), 1);
    assert!(!coordinator.is_in_flight(&key));

    // Once finished, the next request fetches again.
    let third = coordinator.request(key.clone(), fetcher.clone()).await;
    assert_eq!(third.unwrap().as_str(), r#"["user","42"] #2"#);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_fetch_is_discarded() {
    let config = setup_config(|c| c.stale_time = None);
    let fetcher = numbered_fetcher();
    let store = CacheStore::<String>::new(config);
    let key = query_key!["x"];
    let observer = RecordingObserver::new();
    let _subscription = store.subscribe(key.clone(), observer.clone());
    store.set(key.clone(), "cached".to_owned());

    let channel = store.fetch(&key, fetcher.clone());
    settle().await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(store.peek(&key).unwrap().status, FetchStatus::Pending);

    assert!(store.cancel(&key));
    assert!(!store.cancel(&key));
    assert_eq!(channel.await, Err(CacheError::Cancelled));
    assert!(fetcher.token(1).unwrap().is_cancelled());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let snapshot = store.peek(&key).unwrap();
    assert_eq!(snapshot.status, FetchStatus::Fresh);
    assert_eq!(snapshot.value.as_deref().map(String::as_str), Some("cached"));
    assert!(!snapshot.is_fetching);
    assert_eq!(observer.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_keeps_value() {
    let config = setup_config(|c| {
        c.stale_time = None;
        c.retry = 0;
    });
    let fetcher = CountingFetcher::new(LATENCY, |_, call| match call {
        1 => Ok("first".to_owned()),
        _ => Err(CacheError::fetch("boom")),
    });
    let store = CacheStore::with_fetcher(config, fetcher.clone());
    let key = query_key!["x"];
    let observer = RecordingObserver::new();
    let _subscription = store.subscribe(key.clone(), observer.clone());

    store.query_known(&key).await.unwrap();
    assert_eq!(
        store.refetch(&key).await,
        Err(CacheError::Fetch("boom".into()))
    );

    let snapshot = store.peek(&key).unwrap();
    assert_eq!(snapshot.status, FetchStatus::Error);
    assert_eq!(snapshot.value.as_deref().map(String::as_str), Some("first"));
    assert_eq!(snapshot.error, Some(CacheError::Fetch("boom".into())));
    assert_eq!(snapshot.failure_count, 1);

    insta::assert_snapshot!(observer.describe(), @r#"
    updated: "first"
    failed: fetch failed: boom
    "#);
}

#[tokio::test(start_paused = true)]
async fn test_failed_first_fetch() {
    let config = setup_config(|c| c.retry = 0);
    let fetcher =
        CountingFetcher::<String>::new(LATENCY, |_, _| Err(CacheError::fetch("offline")));
    let store = CacheStore::<String>::new(config);
    let key = query_key!["x"];

    let result = store.query(&key, fetcher).await;
    assert_eq!(result, Err(CacheError::Fetch("offline".into())));

    let snapshot = store.peek(&key).unwrap();
    assert_eq!(snapshot.status, FetchStatus::Error);
    assert_eq!(snapshot.value, None);
}

#[tokio::test(start_paused = true)]
async fn test_retries_with_backoff() {
    let config = setup_config(|c| {
        c.retry = 3;
        c.retry_delay = Duration::from_secs(1);
    });
    let fetcher = CountingFetcher::new(LATENCY, |_, call| match call {
        1 | 2 => Err(CacheError::fetch("flaky")),
        _ => Ok(call),
    });
    let store = CacheStore::with_fetcher(config, fetcher.clone());

    let start = Instant::now();
    let value = store.query_known(&query_key!["x"]).await.unwrap();
    assert_eq!(*value, 3);
    assert_eq!(fetcher.calls(), 3);

    // Three attempts plus retry delays of 1s and 2s.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_not_retried() {
    let config = setup_config(|c| c.retry = 3);
    let fetcher = CountingFetcher::<String>::new(LATENCY, |_, _| Err(CacheError::NotFound));
    let store = CacheStore::with_fetcher(config, fetcher.clone());

    let result = store.query_known(&query_key!["x"]).await;
    assert_eq!(result, Err(CacheError::NotFound));
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_no_fetcher() {
    let config = setup_config(|_| {});
    let store = CacheStore::<String>::new(config);
    let key = query_key!["x"];

    assert_eq!(store.query_known(&key).await, Err(CacheError::NotFound));
    assert_eq!(store.refetch(&query_key!["y"]).await, Err(CacheError::NotFound));
    assert!(store.get(&query_key!["y"]).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_refetch_reuses_last_fetcher() {
    let config = setup_config(|_| {});
    let fetcher = numbered_fetcher();
    let store = CacheStore::<String>::new(config);
    let key = query_key!["x"];

    store.query(&key, fetcher.clone()).await.unwrap();
    let value = store.refetch(&key).await.unwrap();
    assert_eq!(value.as_str(), r#"["x"] #2"#);
}

#[tokio::test(start_paused = true)]
async fn test_structural_sharing() {
    let config = setup_config(|c| c.stale_time = None);
    let store = CacheStore::<serde_json::Value>::with_comparator(config, JsonComparator).build();
    let key = query_key!["post", 1];
    let observer = RecordingObserver::new();
    let _subscription = store.subscribe(key.clone(), observer.clone());

    assert!(store.set(key.clone(), json!({"id": 1, "tags": ["a", "b"], "score": 1.0})));
    let first = store.peek(&key).unwrap().value.unwrap();

    assert!(!store.set(key.clone(), json!({"score": 1, "tags": ["a", "b"], "id": 1})));
    let second = store.peek(&key).unwrap().value.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(observer.count(), 1);

    // Fetch results are shared the same way.
    let fetcher = CountingFetcher::new(LATENCY, |_, _| {
        Ok(json!({"id": 1, "tags": ["a", "b"], "score": 1}))
    });
    let fetched = store.fetch(&key, fetcher).await.unwrap();
    assert!(Arc::ptr_eq(&first, &fetched));
    assert_eq!(observer.count(), 1);

    assert!(store.set(key.clone(), json!({"id": 2})));
    assert_eq!(observer.count(), 2);
}

#[tokio::test]
async fn test_structural_sharing_disabled() {
    let config = setup_config(|c| c.structural_sharing = false);
    let store = CacheStore::<i32>::new(config);
    let key = query_key!["x"];
    let observer = RecordingObserver::new();
    let _subscription = store.subscribe(key.clone(), observer.clone());

    assert!(store.set(key.clone(), 1));
    assert!(store.set(key.clone(), 1));
    assert_eq!(observer.values(), vec![Some(Arc::new(1)), Some(Arc::new(1))]);
}
