use std::time::Duration;

use revalidator_cache::{CacheConfig, CacheStore, EntryConfig, QueryKey};
use revalidator_test as test;

pub use test::{CountingFetcher, RecordingObserver, settle};

/// The latency of the fetchers created here.
pub const LATENCY: Duration = Duration::from_millis(100);

/// Sets up logging and returns a cache configuration.
///
/// The `update_config` closure can modify the default settings of every entry.
pub fn setup_config(update_config: impl FnOnce(&mut EntryConfig)) -> CacheConfig {
    test::setup();

    let mut defaults = EntryConfig::default();
    update_config(&mut defaults);
    CacheConfig {
        defaults,
        ..Default::default()
    }
}

/// A fetcher answering with the key and the number of the call, like `["x"] #2`.
pub fn numbered_fetcher() -> CountingFetcher<String> {
    CountingFetcher::new(LATENCY, |key, call| Ok(format!("{key} #{call}")))
}

/// The value currently cached for `key`, without side effects.
pub fn cached<V: Clone + Send + Sync + 'static>(store: &CacheStore<V>, key: &QueryKey) -> Option<V> {
    let value = store.peek(key)?.value?;
    Some(V::clone(&value))
}
