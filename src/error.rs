//! Orchestration errors
//!
//! Every failure surfaced by the controller carries an [`ErrorKind`] so the
//! API layer can map it onto an HTTP status and clients can tell "fix your
//! request" apart from "the system failed" and "try again later".

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of an orchestration failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    HostUnreachable,
    BackendFailure,
    Timeout,
    Unsupported,
    #[serde(rename = "VMNotRunning")]
    VmNotRunning,
    VersionMismatch,
    Internal,
}

/// How a client should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The request itself was wrong; fix the input
    InvalidRequest,
    /// The system could not complete the request; alert
    Failed,
    /// Transient condition; retry later
    RetryLater,
}

impl ErrorKind {
    /// HTTP status code used by the client-facing surface
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidInput | ErrorKind::Unsupported => 400,
            ErrorKind::Timeout => 408,
            ErrorKind::Conflict
            | ErrorKind::VmNotRunning
            | ErrorKind::VersionMismatch
            | ErrorKind::BackendFailure
            | ErrorKind::HostUnreachable => 409,
            ErrorKind::Internal => 500,
        }
    }

    pub fn class(self) -> ErrorClass {
        match self {
            ErrorKind::NotFound
            | ErrorKind::InvalidInput
            | ErrorKind::Unsupported
            | ErrorKind::Conflict
            | ErrorKind::VmNotRunning => ErrorClass::InvalidRequest,
            ErrorKind::HostUnreachable | ErrorKind::Timeout => ErrorClass::RetryLater,
            ErrorKind::BackendFailure | ErrorKind::VersionMismatch | ErrorKind::Internal => {
                ErrorClass::Failed
            }
        }
    }
}

/// Errors returned by controller operations
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Compute '{0}' is unreachable")]
    HostUnreachable(String),

    #[error("Compute '{compute}' failed to {operation}: {detail}")]
    BackendFailure {
        compute: String,
        operation: String,
        detail: String,
    },

    #[error("Timed out after {secs}s waiting for compute '{compute}' to {operation}")]
    Timeout {
        compute: String,
        operation: String,
        secs: u64,
    },

    #[error("{0}")]
    Unsupported(String),

    #[error("Node '{0}' is not running")]
    VmNotRunning(String),

    #[error("Compute '{compute}' runs version {found}, controller expects {expected}")]
    VersionMismatch {
        compute: String,
        found: String,
        expected: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        OrchestratorError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NotFound { .. } => ErrorKind::NotFound,
            OrchestratorError::Conflict(_) => ErrorKind::Conflict,
            OrchestratorError::InvalidInput(_) => ErrorKind::InvalidInput,
            OrchestratorError::HostUnreachable(_) => ErrorKind::HostUnreachable,
            OrchestratorError::BackendFailure { .. } => ErrorKind::BackendFailure,
            OrchestratorError::Timeout { .. } => ErrorKind::Timeout,
            OrchestratorError::Unsupported(_) => ErrorKind::Unsupported,
            OrchestratorError::VmNotRunning(_) => ErrorKind::VmNotRunning,
            OrchestratorError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            OrchestratorError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result alias used across the controller
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
