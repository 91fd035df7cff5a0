use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use revalidator_cache::{
    CacheError, CacheEvent, CacheResult, CacheStore, CancellationToken, MutationController,
    MutationRequest, QueryKey, query_key,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct keys the workload touches.
    pub keys: u32,
    /// How long the simulated server takes to answer a fetch or a mutation.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// The share of server calls that fail, between 0 and 1.
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub mix: OperationMix,
}

/// Relative weights of the operations a workload performs.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct OperationMix {
    pub query: u32,
    pub set: u32,
    pub invalidate: u32,
    pub mutate: u32,
    pub observe: u32,
}

impl Default for OperationMix {
    fn default() -> Self {
        Self {
            query: 80,
            set: 5,
            invalidate: 5,
            mutate: 5,
            observe: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Query,
    Set,
    Invalidate,
    Mutate,
    Observe,
}

impl OperationMix {
    fn pick(&self, roll: u64) -> Operation {
        let weights = [
            (Operation::Query, self.query),
            (Operation::Set, self.set),
            (Operation::Invalidate, self.invalidate),
            (Operation::Mutate, self.mutate),
            (Operation::Observe, self.observe),
        ];
        let total: u64 = weights.iter().map(|(_, weight)| u64::from(*weight)).sum();
        let mut roll = roll % total.max(1);
        for (operation, weight) in weights {
            let weight = u64::from(weight);
            if roll < weight {
                return operation;
            }
            roll -= weight;
        }
        Operation::Query
    }
}

/// The simulated server behind one workload.
pub struct Server {
    latency: Duration,
    error_rate: f64,
    version: AtomicU64,
}

impl Server {
    fn new(latency: Duration, error_rate: f64) -> Self {
        Self {
            latency,
            error_rate,
            version: AtomicU64::new(0),
        }
    }

    async fn call(&self) -> CacheResult<u64> {
        tokio::time::sleep(self.latency).await;
        if rand::random::<f64>() < self.error_rate {
            return Err(CacheError::fetch("simulated server error"));
        }
        Ok(self.version.load(Ordering::Relaxed))
    }

    async fn fetch(&self, key: QueryKey) -> CacheResult<Value> {
        let version = self.call().await?;
        Ok(json!({ "key": key.to_string(), "version": version }))
    }
}

/// Bumps the server-side version of a key.
struct Bump {
    server: Arc<Server>,
}

impl MutationRequest<Value> for Bump {
    type Payload = QueryKey;
    type Output = ();

    fn affected_keys(&self, key: &QueryKey) -> Vec<QueryKey> {
        vec![key.clone()]
    }

    fn optimistic_value(
        &self,
        _key: &QueryKey,
        current: Option<&Value>,
        _payload: &QueryKey,
    ) -> Option<Value> {
        let mut value = current?.clone();
        let version = value["version"].as_u64().unwrap_or_default();
        value["version"] = json!(version + 1);
        Some(value)
    }

    fn execute<'a>(&'a self, _key: &'a QueryKey) -> BoxFuture<'a, CacheResult<()>> {
        Box::pin(async move {
            self.server.call().await?;
            self.server.version.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}

/// A workload bound to its own key space in the shared store.
pub struct PreparedWorkload {
    pub index: usize,
    pub concurrency: usize,
    keys: u32,
    mix: OperationMix,
    server: Arc<Server>,
    mutations: Bump,
    counter: AtomicU64,
}

pub fn prepare_workload(index: usize, workload: Workload) -> PreparedWorkload {
    let server = Arc::new(Server::new(workload.latency, workload.error_rate));
    PreparedWorkload {
        index,
        concurrency: workload.concurrency,
        keys: workload.keys.max(1),
        mix: workload.mix,
        mutations: Bump {
            server: Arc::clone(&server),
        },
        server,
        counter: AtomicU64::new(0),
    }
}

impl PreparedWorkload {
    fn prefix(&self) -> QueryKey {
        query_key!["workload", self.index as u32]
    }

    fn key(&self, n: u32) -> QueryKey {
        self.prefix().child(n)
    }

    /// A fetcher answering every key of this workload.
    pub fn fetcher(
        &self,
    ) -> impl Fn(QueryKey, CancellationToken) -> BoxFuture<'static, CacheResult<Value>>
    + Clone
    + Send
    + Sync
    + 'static {
        let server = Arc::clone(&self.server);
        move |key, _token| {
            let server = Arc::clone(&server);
            Box::pin(async move { server.fetch(key).await })
        }
    }

    /// Fetches every key once.
    pub async fn warmup(&self, store: &CacheStore<Value>) {
        let fetcher = self.fetcher();
        let keys: Vec<_> = (0..self.keys).map(|n| self.key(n)).collect();
        let queries = keys.iter().map(|key| store.query(key, fetcher.clone()));
        futures::future::join_all(queries).await;
    }

    /// Runs the next operation of the workload.
    pub async fn process(
        &self,
        store: &CacheStore<Value>,
        controller: &MutationController<Value>,
    ) {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let key = self.key(rand::random_range(0..self.keys));

        match self.mix.pick(rand::random()) {
            Operation::Query => {
                // Failed fetches are part of the workload.
                store.query(&key, self.fetcher()).await.ok();
            }
            Operation::Set => {
                store.set(key.clone(), json!({ "key": key.to_string(), "version": n }));
            }
            Operation::Invalidate => {
                // Single keys may have been collected, the key space of the workload has
                // observed entries as long as it runs.
                store.invalidate(&self.prefix());
            }
            Operation::Mutate => {
                controller.mutate(&self.mutations, key).await.ok();
            }
            Operation::Observe => {
                let observer = |_: &QueryKey, _: &CacheEvent<Value>| {};
                let subscription = store.subscribe(key.clone(), observer);
                store.query(&key, self.fetcher()).await.ok();
                drop(subscription);
            }
        }
    }
}
