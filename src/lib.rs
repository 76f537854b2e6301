//! Schema Sampler - live schema sampling for document collections
//!
//! Provides:
//! - A sampling pipeline that counts a namespace, draws a bounded sample and
//!   streams it through a schema analyzer
//! - An observable state machine reporting phase, progress and elapsed time
//! - Cancellable event streams with single-consumer handlers and piping
//! - A default document schema analyzer and an in-memory data store

pub mod inference;
pub mod sampling;
pub mod store;
pub mod stream;

pub use inference::{AnalysisError, DocumentAnalyzer, Schema, SchemaAnalyzer, SchemaBuilder};
pub use sampling::{
    ErrorInfo, FailureKind, Progress, SamplingConfig, SamplingError, SamplingPhase,
    SamplingPipeline, SamplingRequest, SamplingResult, SamplingState,
};
pub use store::{DataStore, MemoryStore, Namespace, ReadPreference, Record, StoreError};
pub use stream::{CancellableStream, StreamCloser, StreamError, StreamEvent, StreamSender};
