//! Error types for braid
//!
//! Errors fall into two families:
//! - Expected, recoverable outcomes returned to the caller: not-found,
//!   validation, conflict, cycle-detected. Nothing was mutated.
//! - Failures where persisted state may be inconsistent: integrity, io.
//!   Callers (often autonomous agents) use `consistency_risk` to decide
//!   whether to retry, modify the request, or escalate.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for braid operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("dependency cycle: {task_id} -> {depends_on} would close a cycle of blocking edges")]
    CycleDetected { task_id: String, depends_on: String },

    #[error("integrity failure: {0}")]
    Integrity(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl Error {
    /// Stable machine-readable code for the tool-call layer.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Validation(_) => "validation",
            Error::Conflict(_) => "conflict",
            Error::CycleDetected { .. } => "cycle_detected",
            Error::Integrity(_) => "integrity",
            Error::InvalidConfig(_) | Error::TomlParse(_) => "invalid_config",
            Error::Json(_) => "integrity",
            Error::LockFailed(_) | Error::Io(_) => "io",
        }
    }

    /// Whether the failure leaves persisted state possibly inconsistent.
    ///
    /// `false` means nothing happened and the request can be corrected and
    /// retried; `true` means the store and the tracked file may disagree.
    pub fn consistency_risk(&self) -> bool {
        matches!(
            self,
            Error::Integrity(_) | Error::Io(_) | Error::Json(_) | Error::LockFailed(_)
        )
    }
}

/// Result type alias for braid operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for returning errors across the tool-call boundary in JSON form
#[derive(serde::Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
    pub consistency_risk: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        ErrorBody {
            error: err.to_string(),
            kind: err.kind(),
            consistency_risk: err.consistency_risk(),
            details: None,
        }
    }
}
