//! Schema inference over sampled records
//!
//! [`SchemaBuilder`] accumulates documents into a [`Schema`] of fields, their
//! observed types and how often each appears. [`DocumentAnalyzer`] runs a
//! builder behind the [`SchemaAnalyzer`] stream transform used by the
//! sampling pipeline.
//!
//! # Example
//!
//! ```rust
//! use schema_sampler::inference::SchemaBuilder;
//!
//! let mut builder = SchemaBuilder::new();
//! builder.add_json(r#"{"name": "Alice", "age": 30}"#).unwrap();
//! builder.add_json(r#"{"name": "Bob", "email": "bob@example.com"}"#).unwrap();
//!
//! let schema = builder.finish();
//! assert_eq!(schema.count, 2);
//! assert_eq!(schema.field("email").unwrap().probability, 0.5);
//! ```

mod analyzer;
mod config;
mod error;
mod types;

pub use analyzer::{DocumentAnalyzer, SchemaAnalyzer, SchemaBuilder};
pub use config::{AnalyzerConfig, AnalyzerConfigBuilder};
pub use error::AnalysisError;
pub use types::{FieldType, Schema, SchemaField, SchemaType};
