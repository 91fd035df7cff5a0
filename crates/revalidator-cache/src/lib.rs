//! A reactive cache for asynchronously produced values.
//!
//! Values live in a [`CacheStore`] under hierarchical [`QueryKey`]s. The store serves fresh
//! values from memory, revalidates stale ones in the background, deduplicates concurrent
//! fetches of the same key and notifies [observers](Notifiable) whenever a value actually
//! changes. Entries nobody observes are collected after a grace period.
//!
//! Changes to server-side data go through the [`MutationController`], which applies them
//! optimistically and rolls them back when the server rejects them.
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use revalidator_cache::{
//!     CacheConfig, CacheResult, CacheStore, CancellationToken, QueryKey, query_key,
//! };
//!
//! let store = CacheStore::<String>::new(CacheConfig::default());
//! let fetch_track = |key: QueryKey, _token: CancellationToken| async move {
//!     CacheResult::Ok(format!("track {key}"))
//! };
//!
//! let track = store.query(&query_key!["tracks", 1], fetch_track).await.unwrap();
//! assert_eq!(track.as_str(), r#"track ["tracks",1]"#);
//! # }
//! ```

#[macro_use]
pub mod metrics;

pub mod compare;
pub mod config;
mod entry;
mod error;
pub mod fetch;
mod key;
pub mod logging;
pub mod mutation;
mod observer;
mod store;
pub mod utils;

pub use compare::{DeepEq, JsonComparator, StructuralComparator};
pub use config::{CacheConfig, Config, EntryConfig, PrefixConfig};
pub use entry::{EntrySnapshot, FetchStatus};
pub use error::{CacheError, CacheResult};
pub use fetch::{FetchCoordinator, Fetcher, ResultChannel, RetryPolicy};
pub use key::{QueryKey, Segment};
pub use mutation::{MutationController, MutationMode, MutationPhase, MutationRequest};
pub use observer::{CacheEvent, Notifiable, ObserverId};
pub use store::{CacheStore, CacheStoreBuilder, Subscription};
pub use tokio_util::sync::CancellationToken;
