//! Error types for sampling operations

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::SamplingPhase;

/// Errors returned by the sampling API itself
///
/// Failures of a sampling run never surface through this type; they are
/// reported as the `error` phase of the published state (see [`ErrorInfo`]).
#[derive(Error, Debug)]
pub enum SamplingError {
    /// Caller passed an argument outside the documented contract
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Namespace string could not be parsed
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    /// A stream handler of this kind was already registered
    #[error("A '{0}' handler is already registered on this stream")]
    HandlerAlreadyRegistered(&'static str),

    /// Phase change outside the state machine
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: SamplingPhase,
        to: SamplingPhase,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sampling API operations
pub type SamplingResult<T> = Result<T, SamplingError>;

impl SamplingError {
    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            SamplingError::InvalidNamespace(ns) => {
                format!(
                    "Invalid namespace: {ns}\n\nHint: Use the form 'database.collection'."
                )
            }
            SamplingError::Config(msg) => {
                format!("Invalid configuration: {msg}\n\nHint: Check your sampling configuration.")
            }
            _ => self.to_string(),
        }
    }
}

/// Why a sampling run ended in the `error` phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// The count operation failed (timeout, network, auth)
    CountFailure,
    /// The sampling cursor reported an error
    SampleStreamFailure,
    /// The analyzer reported an error
    AnalysisFailure,
    /// The stream ended without samples although some were expected
    EmptyResultAnomaly,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::CountFailure => "count failure",
            FailureKind::SampleStreamFailure => "sample stream failure",
            FailureKind::AnalysisFailure => "analysis failure",
            FailureKind::EmptyResultAnomaly => "empty result",
        };
        f.write_str(name)
    }
}

/// Failure detail carried by the `error` phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
