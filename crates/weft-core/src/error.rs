//! Error types for Weft Core
//!
//! Failures are classified by kind rather than by concrete source type:
//! retry policies, guardrail accounting, and caller-facing reports all key
//! off [`ErrorKind`]. Only `Transient` failures are ever retried.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Weft Error
pub type Result<T> = std::result::Result<T, Error>;

/// Stable classification of a failure, serialized with snake_case tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Security,
    Transient,
    BudgetExceeded,
    RateLimited,
    RecursionLimit,
    Cancelled,
    Quota,
    Duplicate,
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind may be retried under a retry policy
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Weft error types
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("recursion limit reached: {0}")]
    RecursionLimit(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Security(_) => ErrorKind::Security,
            Error::Transient(_) => ErrorKind::Transient,
            Error::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::RecursionLimit(_) => ErrorKind::RecursionLimit,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::QuotaExceeded(_) => ErrorKind::Quota,
            Error::DuplicateName(_) => ErrorKind::Duplicate,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Structured form suitable for reports and wire serialization
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Validation(e.to_string())
    }
}

/// Failure entry carried in execution contexts and dispatch breakdowns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}
