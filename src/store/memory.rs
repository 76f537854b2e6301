//! In-memory data store
//!
//! Holds JSON documents per namespace. Used by tests and by embedders that
//! want to profile documents already in memory.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::{CountOptions, DataStore, Filter, Namespace, Record, SampleOptions, StoreError};
use crate::stream::CancellableStream;

/// Multiplier for the deterministic sample ordering (Knuth)
const KNUTH_MULTIPLIER: u64 = 2_654_435_761;

/// Data store backed by in-process JSON documents
///
/// `sample` returns matching documents in a pseudo-random but reproducible
/// order determined by the store's seed. Delays and failures can be injected
/// to exercise timing and error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Record>>>,
    seed: u64,
    count_delay: Option<Duration>,
    record_delay: Option<Duration>,
    count_failure: Mutex<Option<StoreError>>,
    sample_failure: Mutex<Option<(u64, StoreError)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed for the sample ordering
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Delay every count by `delay`
    pub fn with_count_delay(mut self, delay: Duration) -> Self {
        self.count_delay = Some(delay);
        self
    }

    /// Delay every sampled record by `delay`
    pub fn with_record_delay(mut self, delay: Duration) -> Self {
        self.record_delay = Some(delay);
        self
    }

    /// Add documents to a namespace, creating it if needed
    pub fn insert(&self, namespace: &Namespace, records: impl IntoIterator<Item = Record>) {
        let mut collections = match self.collections.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        collections
            .entry(namespace.to_string())
            .or_default()
            .extend(records);
    }

    /// Make every subsequent count fail with `error`
    pub fn fail_count(&self, error: StoreError) {
        *lock(&self.count_failure) = Some(error);
    }

    /// Make every subsequent sample stream fail with `error` after `records`
    /// records have been delivered
    pub fn fail_sample_after(&self, records: u64, error: StoreError) {
        *lock(&self.sample_failure) = Some((records, error));
    }

    /// Remove injected failures
    pub fn clear_failures(&self) {
        *lock(&self.count_failure) = None;
        *lock(&self.sample_failure) = None;
    }

    fn matching(&self, namespace: &Namespace, filter: &Filter) -> Vec<Record> {
        let collections = match self.collections.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        collections
            .get(&namespace.to_string())
            .map(|records| {
                records
                    .iter()
                    .filter(|record| matches_filter(record, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Matching documents in sample order, at most `size` of them
    fn sampled(&self, namespace: &Namespace, filter: &Filter, size: u64) -> Vec<Record> {
        let records = self.matching(namespace, filter);
        let mut indices: Vec<usize> = (0..records.len()).collect();
        indices.sort_by_key(|&i| (i as u64 ^ self.seed).wrapping_mul(KNUTH_MULTIPLIER));
        indices.truncate(usize::try_from(size).unwrap_or(usize::MAX));
        indices.into_iter().map(|i| records[i].clone()).collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Top-level field equality; anything but an object matches every record
fn matches_filter(record: &Record, filter: &Filter) -> bool {
    let Value::Object(conditions) = filter else {
        return true;
    };
    conditions
        .iter()
        .all(|(field, expected)| record.get(field) == Some(expected))
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn count(
        &self,
        namespace: &Namespace,
        filter: &Filter,
        options: &CountOptions,
    ) -> Result<u64, StoreError> {
        let failure = lock(&self.count_failure).clone();
        let count = self.matching(namespace, filter).len() as u64;
        let delay = self.count_delay;

        let work = async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match failure {
                Some(error) => Err(error),
                None => Ok(count),
            }
        };

        // zero means no limit
        if options.max_time_ms == 0 {
            return work.await;
        }
        tokio::time::timeout(Duration::from_millis(options.max_time_ms), work)
            .await
            .map_err(|_| StoreError::Timeout(options.max_time_ms))?
    }

    fn sample(&self, namespace: &Namespace, options: &SampleOptions) -> CancellableStream<Record> {
        let records = self.sampled(namespace, &options.filter, options.size);
        let failure = lock(&self.sample_failure).clone();
        let delay = self.record_delay;
        let max_time_ms = options.max_time_ms;
        debug!(
            namespace = %namespace,
            records = records.len(),
            "Opening memory sample cursor"
        );

        let (events, stream) = CancellableStream::channel(records.len().clamp(1, 64));
        let task = tokio::spawn(async move {
            let deadline = (max_time_ms > 0)
                .then(|| Instant::now() + Duration::from_millis(max_time_ms));
            for (delivered, record) in records.into_iter().enumerate() {
                if let Some((after, error)) = &failure {
                    if delivered as u64 >= *after {
                        events.error(error.clone()).await;
                        return;
                    }
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                    events.error(StoreError::Timeout(max_time_ms)).await;
                    return;
                }
                if !events.data(record).await {
                    return;
                }
            }
            // a failure point at or past the end still fires
            if let Some((_, error)) = failure {
                events.error(error).await;
            }
        });
        stream.attach_task(task.abort_handle());
        stream
    }
}
