//! Configuration for the document analyzer

use serde::{Deserialize, Serialize};

/// Configuration for [`DocumentAnalyzer`](super::DocumentAnalyzer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyzerConfig {
    /// Maximum nesting depth for documents and arrays
    pub max_depth: usize,

    /// Emit an intermediate schema every N records (0 = final schema only)
    pub snapshot_interval: usize,

    /// Maximum number of distinct example values kept per field (0 = none)
    pub max_examples: usize,

    /// Capacity of the analyzer's outgoing event channel
    pub event_capacity: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            snapshot_interval: 0,
            max_examples: 0,
            event_capacity: 64,
        }
    }
}

impl AnalyzerConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for custom configuration
    pub fn builder() -> AnalyzerConfigBuilder {
        AnalyzerConfigBuilder::default()
    }
}

/// Builder for AnalyzerConfig
#[derive(Debug, Default)]
pub struct AnalyzerConfigBuilder {
    config: AnalyzerConfig,
}

impl AnalyzerConfigBuilder {
    /// Set the maximum nesting depth
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.config.max_depth = depth;
        self
    }

    /// Set the intermediate snapshot interval
    pub fn snapshot_interval(mut self, records: usize) -> Self {
        self.config.snapshot_interval = records;
        self
    }

    /// Set the maximum number of examples per field
    pub fn max_examples(mut self, max: usize) -> Self {
        self.config.max_examples = max;
        self
    }

    /// Set the event channel capacity (at least 1)
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    /// Build the configuration
    pub fn build(self) -> AnalyzerConfig {
        self.config
    }
}
