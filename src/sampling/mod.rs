//! Sampling pipeline and its observable state
//!
//! - `progress`: percent policy and monotonic elapsed time
//! - `state`: phases, the transition table and the published snapshot
//! - `pipeline`: count, sample and analyze orchestration
//! - `config`: defaults, builder and file loading
//! - `error`: API errors and the run failure taxonomy

mod config;
mod error;
mod pipeline;
mod progress;
mod state;

pub use config::{DEFAULT_MAX_TIME_MS, DEFAULT_SAMPLE_SIZE, SamplingConfig, SamplingConfigBuilder};
pub use error::{ErrorInfo, FailureKind, SamplingError, SamplingResult};
pub use pipeline::{SamplingPipeline, SamplingRequest};
pub use progress::{
    ProgressTracker, compute_percent, elapsed_ms, format_elapsed, number_of_samples,
};
pub use state::{Progress, SamplingPhase, SamplingState};
