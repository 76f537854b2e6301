//! Data store abstraction
//!
//! Defines the DataStore trait consumed by the sampling pipeline:
//! - `count`: number of records in a namespace matching a filter
//! - `sample`: a stream of approximately-random records
//!
//! MemoryStore is an in-process implementation backed by JSON documents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::stream::CancellableStream;

mod memory;
mod namespace;

pub use memory::MemoryStore;
pub use namespace::Namespace;

/// A single document drawn from a namespace
pub type Record = serde_json::Value;

/// Query expression restricting which records are counted and sampled
pub type Filter = serde_json::Value;

/// Error type for data store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Operation exceeded time limit of {0}ms")]
    Timeout(u64),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),
    #[error("Cursor error: {0}")]
    Cursor(String),
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Routing policy for read operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreference {
    Primary,
    #[default]
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// Options for a count operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountOptions {
    pub max_time_ms: u64,
    pub read_preference: ReadPreference,
}

/// Options for a sample operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleOptions {
    pub max_time_ms: u64,
    pub filter: Filter,
    pub size: u64,
    pub read_preference: ReadPreference,
}

/// Trait for data stores that can count and sample a namespace
///
/// `sample` returns immediately; records, errors and end of stream arrive
/// through the returned stream. Closing the stream must release the
/// underlying cursor.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Count records in `namespace` matching `filter`
    async fn count(
        &self,
        namespace: &Namespace,
        filter: &Filter,
        options: &CountOptions,
    ) -> Result<u64, StoreError>;

    /// Open a stream of sampled records
    fn sample(&self, namespace: &Namespace, options: &SampleOptions) -> CancellableStream<Record>;
}
