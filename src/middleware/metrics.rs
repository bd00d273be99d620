//! Per-operation counters and durations.
//!
//! Every call increments `database.<op>` and `database.<type>.<op>`, records
//! its duration under the same keys, and on failure also increments the
//! `.error` counters.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::dbplugin::{
    Database, DatabaseResult, DeleteUserRequest, DeleteUserResponse, InitializeRequest,
    InitializeResponse, NewUserRequest, NewUserResponse, UpdateUserRequest, UpdateUserResponse,
};

/// Aggregated duration samples for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationSummary {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl DurationSummary {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// Lock-free registry shared by every metrics wrapper in the process.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<String, u64>,
    durations: DashMap<String, DurationSummary>,
}

static GLOBAL: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by every adapter instance in this process.
    pub fn global() -> Arc<MetricsRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MetricsRegistry::new())))
    }

    pub fn incr_counter(&self, key: &[&str]) {
        *self.counters.entry(key.join(".")).or_insert(0) += 1;
    }

    pub fn measure_since(&self, key: &[&str], start: Instant) {
        let took = start.elapsed();
        let mut entry = self.durations.entry(key.join(".")).or_default();
        entry.count += 1;
        entry.total += took;
        entry.max = entry.max.max(took);
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).map_or(0, |v| *v)
    }

    pub fn durations(&self, key: &str) -> Option<DurationSummary> {
        self.durations.get(key).map(|v| *v)
    }

    /// Sorted copy of every counter.
    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

pub struct Metrics<D> {
    next: D,
    type_name: String,
    registry: Arc<MetricsRegistry>,
}

impl<D: Database> Metrics<D> {
    pub fn new(next: D, type_name: impl Into<String>, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            next,
            type_name: type_name.into(),
            registry,
        }
    }

    async fn measured<T, F>(&self, op: &'static str, call: F) -> DatabaseResult<T>
    where
        F: Future<Output = DatabaseResult<T>> + Send,
    {
        let ty = self.type_name.as_str();
        self.registry.incr_counter(&["database", op]);
        self.registry.incr_counter(&["database", ty, op]);

        let start = Instant::now();
        let result = call.await;

        self.registry.measure_since(&["database", op], start);
        self.registry.measure_since(&["database", ty, op], start);
        if result.is_err() {
            self.registry.incr_counter(&["database", op, "error"]);
            self.registry.incr_counter(&["database", ty, op, "error"]);
        }
        result
    }
}

#[async_trait]
impl<D: Database> Database for Metrics<D> {
    async fn initialize(&self, req: InitializeRequest) -> DatabaseResult<InitializeResponse> {
        self.measured("initialize", self.next.initialize(req)).await
    }

    async fn new_user(&self, req: NewUserRequest) -> DatabaseResult<NewUserResponse> {
        self.measured("new_user", self.next.new_user(req)).await
    }

    async fn update_user(&self, req: UpdateUserRequest) -> DatabaseResult<UpdateUserResponse> {
        self.measured("update_user", self.next.update_user(req)).await
    }

    async fn delete_user(&self, req: DeleteUserRequest) -> DatabaseResult<DeleteUserResponse> {
        self.measured("delete_user", self.next.delete_user(req)).await
    }

    async fn type_name(&self) -> DatabaseResult<String> {
        self.next.type_name().await
    }

    async fn close(&self) -> DatabaseResult<()> {
        self.measured("close", self.next.close()).await
    }
}
