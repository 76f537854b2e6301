//! Observable sampling state and its phase machine
//!
//! ```text
//! initial -> counting -> sampling -> analyzing -> complete
//!               |           |  \          |
//!               +-> error <-+   +-> complete (zero target)
//!                     ^               |
//!                     +---------------+
//! any phase -> initial (reset)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::DEFAULT_MAX_TIME_MS;
use super::error::{ErrorInfo, SamplingError, SamplingResult};
use crate::inference::Schema;

/// Discrete phase of a sampling run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SamplingPhase {
    #[default]
    Initial,
    Counting,
    Sampling,
    Analyzing,
    Complete,
    Error,
}

impl SamplingPhase {
    /// Get the phase name
    pub fn name(&self) -> &'static str {
        match self {
            SamplingPhase::Initial => "initial",
            SamplingPhase::Counting => "counting",
            SamplingPhase::Sampling => "sampling",
            SamplingPhase::Analyzing => "analyzing",
            SamplingPhase::Complete => "complete",
            SamplingPhase::Error => "error",
        }
    }

    /// A run is in flight in this phase
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SamplingPhase::Counting | SamplingPhase::Sampling | SamplingPhase::Analyzing
        )
    }

    /// The run has ended in this phase; only a reset leaves it
    pub fn is_terminal(&self) -> bool {
        matches!(self, SamplingPhase::Complete | SamplingPhase::Error)
    }

    /// Check whether the phase machine allows moving to `next`
    pub fn can_transition_to(&self, next: SamplingPhase) -> bool {
        use SamplingPhase::*;

        match (self, next) {
            (_, Initial) => true,
            (Initial, Counting) => true,
            (Counting, Sampling | Error) => true,
            // complete straight from sampling only happens for a zero-size target
            (Sampling, Analyzing | Error | Complete) => true,
            (Analyzing, Complete | Error) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SamplingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress of the current run
///
/// `Indeterminate` orders below every percentage so that the first
/// percentage published after counting is always an increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Progress {
    #[default]
    Indeterminate,
    Percent(u8),
}

impl Progress {
    pub fn percent(&self) -> Option<u8> {
        match self {
            Progress::Indeterminate => None,
            Progress::Percent(p) => Some(*p),
        }
    }
}

/// Snapshot of the sampling subsystem
///
/// Replaced wholesale on every transition; subscribers always receive a
/// complete value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingState {
    pub phase: SamplingPhase,
    pub progress: Progress,
    pub elapsed_ms: u64,
    /// Server-side time limit used for the next request
    pub max_time_ms: u64,
    /// Set if and only if `phase` is `Complete`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Schema>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl SamplingState {
    /// Fresh `initial` state
    pub fn initial(max_time_ms: u64) -> Self {
        Self {
            phase: SamplingPhase::Initial,
            progress: Progress::Percent(0),
            elapsed_ms: 0,
            max_time_ms,
            schema: None,
            error: None,
            run_id: None,
            started_at: None,
        }
    }

    /// Copy of this state moved to `next`, validated against the phase machine
    ///
    /// The schema is dropped on every transition; callers entering
    /// `Complete` attach it afterwards.
    pub fn transition(&self, next: SamplingPhase) -> SamplingResult<Self> {
        if !self.phase.can_transition_to(next) {
            return Err(SamplingError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        Ok(Self {
            phase: next,
            schema: None,
            ..self.clone()
        })
    }
}

impl Default for SamplingState {
    fn default() -> Self {
        Self::initial(DEFAULT_MAX_TIME_MS)
    }
}
