//! Incremental document analyzer

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::config::AnalyzerConfig;
use super::error::AnalysisError;
use super::types::{FieldType, Schema, SchemaField, SchemaType};
use crate::store::Record;
use crate::stream::CancellableStream;

/// Transform from a record stream to a schema event stream
///
/// Implementations emit one progress event per analyzed record, any number
/// of cumulative schema snapshots as data events (the last one before end
/// wins), and end once the record channel is exhausted. A failure is
/// reported as a single error event.
pub trait SchemaAnalyzer: Send + Sync {
    fn analyze(&self, records: mpsc::Receiver<Record>) -> CancellableStream<Schema>;
}

/// Default analyzer built on [`SchemaBuilder`]
#[derive(Debug, Clone, Default)]
pub struct DocumentAnalyzer {
    config: AnalyzerConfig,
}

impl DocumentAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AnalyzerConfig) -> Self {
        Self { config }
    }
}

impl SchemaAnalyzer for DocumentAnalyzer {
    fn analyze(&self, mut records: mpsc::Receiver<Record>) -> CancellableStream<Schema> {
        let (events, stream) = CancellableStream::channel(self.config.event_capacity);
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            let snapshot_interval = config.snapshot_interval;
            let mut builder = SchemaBuilder::with_config(config);

            while let Some(record) = records.recv().await {
                if let Err(e) = builder.add_record(&record) {
                    debug!(error = %e, records = builder.record_count(), "Analysis failed");
                    events.error(e).await;
                    return;
                }
                if !events.progress().await {
                    return;
                }
                let analyzed = builder.record_count() as usize;
                if snapshot_interval > 0
                    && analyzed % snapshot_interval == 0
                    && !events.data(builder.snapshot()).await
                {
                    return;
                }
            }

            debug!(records = builder.record_count(), "Analysis finished");
            events.data(builder.finish()).await;
        });
        stream.attach_task(task.abort_handle());
        stream
    }
}

#[derive(Debug, Default)]
struct ValueStats {
    count: u64,
    types: BTreeMap<FieldType, TypeStats>,
    examples: Vec<Value>,
}

#[derive(Debug, Default)]
struct TypeStats {
    count: u64,
    /// object members, keyed by name
    fields: BTreeMap<String, ValueStats>,
    /// array elements
    items: Option<Box<ValueStats>>,
}

/// Accumulates documents into a [`Schema`]
///
/// Analyzes JSON documents one at a time; a snapshot can be taken at any
/// point.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    config: AnalyzerConfig,
    root: TypeStats,
}

impl SchemaBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new builder with custom configuration
    pub fn with_config(config: AnalyzerConfig) -> Self {
        Self {
            config,
            root: TypeStats::default(),
        }
    }

    /// Add a single JSON string for analysis
    pub fn add_json(&mut self, json: &str) -> Result<(), AnalysisError> {
        let value: Value = serde_json::from_str(json)?;
        self.add_record(&value)
    }

    /// Add a document for analysis
    ///
    /// A rejected record leaves the accumulated schema untouched.
    pub fn add_record(&mut self, record: &Value) -> Result<(), AnalysisError> {
        let Value::Object(members) = record else {
            return Err(AnalysisError::InvalidStructure(
                FieldType::of(record).type_name().to_string(),
            ));
        };
        check_depth(record, 0, self.config.max_depth)?;

        self.root.count += 1;
        for (name, value) in members {
            self.root
                .fields
                .entry(name.clone())
                .or_default()
                .add(value, self.config.max_examples);
        }
        Ok(())
    }

    /// Number of documents analyzed
    pub fn record_count(&self) -> u64 {
        self.root.count
    }

    /// Schema of the documents seen so far
    pub fn snapshot(&self) -> Schema {
        Schema {
            count: self.root.count,
            fields: fields_of(&self.root, ""),
        }
    }

    /// Final schema
    pub fn finish(self) -> Schema {
        self.snapshot()
    }
}

fn check_depth(value: &Value, depth: usize, max: usize) -> Result<(), AnalysisError> {
    match value {
        Value::Object(members) => {
            if depth > max {
                return Err(AnalysisError::MaxDepthExceeded { depth, max });
            }
            members
                .values()
                .try_for_each(|member| check_depth(member, depth + 1, max))
        }
        Value::Array(items) => {
            if depth > max {
                return Err(AnalysisError::MaxDepthExceeded { depth, max });
            }
            items
                .iter()
                .try_for_each(|item| check_depth(item, depth + 1, max))
        }
        _ => Ok(()),
    }
}

impl ValueStats {
    fn add(&mut self, value: &Value, max_examples: usize) {
        self.count += 1;
        let field_type = FieldType::of(value);
        let stats = self.types.entry(field_type).or_default();
        stats.count += 1;

        match value {
            Value::Object(members) => {
                for (name, member) in members {
                    stats
                        .fields
                        .entry(name.clone())
                        .or_default()
                        .add(member, max_examples);
                }
            }
            Value::Array(items) => {
                let item_stats = stats.items.get_or_insert_with(Box::default);
                for item in items {
                    item_stats.add(item, max_examples);
                }
            }
            Value::Null => {}
            scalar => {
                if self.examples.len() < max_examples && !self.examples.contains(scalar) {
                    self.examples.push(scalar.clone());
                }
            }
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn fields_of(parent: &TypeStats, prefix: &str) -> Vec<SchemaField> {
    parent
        .fields
        .iter()
        .map(|(name, stats)| {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            SchemaField {
                name: name.clone(),
                count: stats.count,
                probability: ratio(stats.count, parent.count),
                types: types_of(stats, &path),
                examples: stats.examples.clone(),
                path,
            }
        })
        .collect()
}

fn types_of(stats: &ValueStats, path: &str) -> Vec<SchemaType> {
    stats
        .types
        .iter()
        .map(|(field_type, type_stats)| SchemaType {
            field_type: *field_type,
            count: type_stats.count,
            probability: ratio(type_stats.count, stats.count),
            fields: fields_of(type_stats, path),
            item_types: type_stats
                .items
                .as_deref()
                .map(|items| types_of(items, path))
                .unwrap_or_default(),
        })
        .collect()
}
