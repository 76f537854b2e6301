//! Error types for schema analysis

use thiserror::Error;

/// Errors that can occur while analyzing sampled records
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    JsonParse(String),

    /// Record is not a document
    #[error("Invalid record structure: expected object at root, found {0}")]
    InvalidStructure(String),

    /// Maximum depth exceeded
    #[error("Maximum nesting depth exceeded: {depth} > {max}")]
    MaxDepthExceeded { depth: usize, max: usize },
}

impl From<serde_json::Error> for AnalysisError {
    fn from(e: serde_json::Error) -> Self {
        AnalysisError::JsonParse(e.to_string())
    }
}
