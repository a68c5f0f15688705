use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure classification surfaced to callers of every orchestrator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input shape, empty batch, unknown session or student.
    Validation,
    /// Training already in flight.
    Conflict,
    /// Dataset missing or empty, model artifact absent, filesystem failure.
    Resource,
    /// The worker exceeded its wall-clock budget and was killed.
    WorkerTimeout,
    /// The worker exited non-zero or produced an unusable record.
    WorkerFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::Resource => "resource",
            Self::WorkerTimeout => "worker_timeout",
            Self::WorkerFailure => "worker_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
