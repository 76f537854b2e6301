//! Configuration for sampling runs

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{SamplingError, SamplingResult};
use crate::store::ReadPreference;

/// Default server-side time limit for count and sample operations
pub const DEFAULT_MAX_TIME_MS: u64 = 10_000;

/// Default upper bound on the number of sampled records
pub const DEFAULT_SAMPLE_SIZE: u64 = 1000;

/// Configuration for a sampling pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplingConfig {
    /// Per-operation server-side timeout passed to count and sample
    pub max_time_ms: u64,

    /// Upper bound on the sample draw
    pub sample_size: u64,

    /// Routing policy for count and sample operations
    pub read_preference: ReadPreference,

    /// How often elapsed time is refreshed while a run is live
    pub tick_interval_ms: u64,

    /// Capacity of the channel between the sampler and the analyzer
    pub channel_capacity: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_time_ms: DEFAULT_MAX_TIME_MS,
            sample_size: DEFAULT_SAMPLE_SIZE,
            read_preference: ReadPreference::default(),
            tick_interval_ms: 1000,
            channel_capacity: 64,
        }
    }
}

impl SamplingConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for custom configuration
    pub fn builder() -> SamplingConfigBuilder {
        SamplingConfigBuilder::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> SamplingResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| SamplingError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document
    pub fn from_yaml_str(content: &str) -> SamplingResult<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| SamplingError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a `.toml`, `.yaml` or `.yml` file
    pub fn load(path: &Path) -> SamplingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            _ => Err(SamplingError::Config(format!(
                "unsupported config file: {}",
                path.display()
            ))),
        }
    }

    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> SamplingResult<()> {
        if self.sample_size == 0 {
            return Err(SamplingError::Config(
                "sampleSize must be greater than zero".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(SamplingError::Config(
                "channelCapacity must be greater than zero".to_string(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(SamplingError::Config(
                "tickIntervalMs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Raise zero sizes and intervals to 1
    pub fn clamped(mut self) -> Self {
        self.sample_size = self.sample_size.max(1);
        self.tick_interval_ms = self.tick_interval_ms.max(1);
        self.channel_capacity = self.channel_capacity.max(1);
        self
    }
}

/// Builder for SamplingConfig
#[derive(Debug, Default)]
pub struct SamplingConfigBuilder {
    config: SamplingConfig,
}

impl SamplingConfigBuilder {
    /// Set the server-side time limit
    pub fn max_time_ms(mut self, ms: u64) -> Self {
        self.config.max_time_ms = ms;
        self
    }

    /// Set the sample size (at least 1)
    pub fn sample_size(mut self, size: u64) -> Self {
        self.config.sample_size = size.max(1);
        self
    }

    /// Set the read preference
    pub fn read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.config.read_preference = read_preference;
        self
    }

    /// Set the elapsed-time refresh interval (at least 1ms)
    pub fn tick_interval_ms(mut self, ms: u64) -> Self {
        self.config.tick_interval_ms = ms.max(1);
        self
    }

    /// Set the sampler-to-analyzer channel capacity (at least 1)
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    /// Build the configuration
    pub fn build(self) -> SamplingConfig {
        self.config
    }
}
