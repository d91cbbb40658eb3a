//! Error types for streamscope
//!
//! Centralized error handling using thiserror. Contract violations are the
//! scheduler's fatal failures: they identify a scheduling or client bug and
//! are never retried.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::scope::StreamId;

/// Category of a contract violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Work before begin, end before the barrier, or a once-only hook invoked twice
    Ordering,
    /// Observed transition counts or accumulated values disagree with expectations
    Count,
    /// A process-scope artifact was read before it was produced
    MissingArtifact,
    /// A cache outlived its scope or the cache pool was not empty at job end
    Leak,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViolationKind::Ordering => "ordering",
            ViolationKind::Count => "count",
            ViolationKind::MissingArtifact => "missing artifact",
            ViolationKind::Leak => "leak",
        };
        f.write_str(name)
    }
}

/// " in <scope> on <stream>" for whichever of the two is known
fn location(scope: &Option<String>, stream: &Option<StreamId>) -> String {
    let mut out = String::new();
    if let Some(scope) = scope {
        out.push_str(&format!(" in {}", scope));
    }
    if let Some(stream) = stream {
        out.push_str(&format!(" on {}", stream));
    }
    out
}

/// A fatal ordering or consistency failure detected at runtime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} violation{}: {message}", location(.scope, .stream))]
pub struct ContractViolation {
    pub kind: ViolationKind,
    /// Scope the violation was detected in (e.g. "run 1", "lumi 1:3")
    pub scope: Option<String>,
    /// Stream slot the violation was detected on
    pub stream: Option<StreamId>,
    pub message: String,
}

impl ContractViolation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            scope: None,
            stream: None,
            message: message.into(),
        }
    }

    pub fn ordering(message: impl Into<String>) -> Self {
        Self::new(ViolationKind::Ordering, message)
    }

    pub fn count(message: impl Into<String>) -> Self {
        Self::new(ViolationKind::Count, message)
    }

    pub fn missing_artifact(message: impl Into<String>) -> Self {
        Self::new(ViolationKind::MissingArtifact, message)
    }

    pub fn leak(message: impl Into<String>) -> Self {
        Self::new(ViolationKind::Leak, message)
    }

    /// Count violation in the "X was A but it was supposed to be B" form
    pub fn expected(what: impl fmt::Display, actual: impl fmt::Display, expected: impl fmt::Display) -> Self {
        Self::count(format!("{} {} but it was supposed to be {}", what, actual, expected))
    }

    pub fn in_scope(mut self, scope: impl fmt::Display) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    pub fn on_stream(mut self, stream: StreamId) -> Self {
        self.stream = Some(stream);
        self
    }
}

/// All error types that can occur in streamscope
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Fatal ordering/count/artifact/leak failure
    #[error("Contract {0}")]
    Contract(#[from] ContractViolation),

    /// Invalid job or scheduler configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed job input description
    #[error("Input error: {0}")]
    Input(String),

    /// A stream worker exited without answering
    #[error("Stream worker lost: {0}")]
    WorkerLost(String),

    /// The job was cancelled after a failure on another stream
    #[error("Job cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchedulerError {
    /// The contract violation behind this error, if any
    pub fn violation(&self) -> Option<&ContractViolation> {
        match self {
            SchedulerError::Contract(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_violation(&self, kind: ViolationKind) -> bool {
        self.violation().is_some_and(|v| v.kind == kind)
    }

    /// Attach the stream slot to a contract violation that has none
    pub fn with_stream(self, stream: StreamId) -> Self {
        match self {
            SchedulerError::Contract(v) if v.stream.is_none() => SchedulerError::Contract(v.on_stream(stream)),
            other => other,
        }
    }
}

/// Result type alias for streamscope operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_display_with_scope_and_stream() {
        let v = ContractViolation::ordering("streamBeginRun before globalBeginRun")
            .in_scope("run 7")
            .on_stream(StreamId(2));
        assert_eq!(
            v.to_string(),
            "ordering violation in run 7 on stream 2: streamBeginRun before globalBeginRun"
        );
    }

    #[test]
    fn test_violation_display_with_stream_only() {
        let v = ContractViolation::count("events 3 but it was supposed to be 4").on_stream(StreamId(1));
        assert_eq!(v.to_string(), "count violation on stream 1: events 3 but it was supposed to be 4");
    }

    #[test]
    fn test_expected_message() {
        let v = ContractViolation::expected("RunIntFilter cache value", 4, 5);
        assert_eq!(v.kind, ViolationKind::Count);
        assert_eq!(v.message, "RunIntFilter cache value 4 but it was supposed to be 5");
    }

    #[test]
    fn test_contract_error_conversion() {
        let err: SchedulerError = ContractViolation::leak("cache pool not empty").into();
        assert!(err.is_violation(ViolationKind::Leak));
        assert!(!err.is_violation(ViolationKind::Ordering));
        assert_eq!(err.to_string(), "Contract leak violation: cache pool not empty");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SchedulerError = io_err.into();
        assert!(matches!(err, SchedulerError::Io(_)));
        assert!(err.violation().is_none());
    }
}
