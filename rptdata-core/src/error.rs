//! Error taxonomy shared by every provider operation
//!
//! Each variant maps to one client-visible outcome. Storage errors are carried
//! through unchanged; nothing in this crate retries.

use rptdata_storage::StorageError;
use thiserror::Error;

/// Failure of a provider operation
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Requested record does not exist in storage
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Malformed query parameters, rejected before any I/O
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Client went away mid-stream
    #[error("Request cancelled by client")]
    Cancelled,

    /// Operation ran past its deadline
    #[error("{operation} exceeded its deadline after {elapsed_ms}ms")]
    TimeoutExceeded {
        operation: &'static str,
        elapsed_ms: u64,
    },

    /// No connection to the decode service
    #[error("Decode service unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Stored record exists but cannot be interpreted
    #[error("Record '{id}' is corrupt: {reason}")]
    CorruptRecord { id: String, reason: String },

    /// Another caller's reconstruction of the same path failed
    #[error("Reconstruction of '{path}' failed: {reason}")]
    Reconstruction {
        path: String,
        reason: String,
        origin: ErrorClass,
    },

    /// Background task could not be joined
    #[error("Background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ProviderError {
    /// Helper to build `NotFound`
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// HTTP-like status code used in error frames and responses
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Reconstruction { origin, .. } => origin.status_code,
            Self::NotFound { .. } => 404,
            Self::InvalidRequest(_) => 400,
            Self::Cancelled | Self::TimeoutExceeded { .. } => 408,
            Self::UpstreamUnavailable(_) => 503,
            Self::CorruptRecord { .. } | Self::Task(_) | Self::Storage(_) => 500,
        }
    }

    /// Short machine-readable code for JSON error bodies
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Cancelled => "CANCELLED",
            Self::TimeoutExceeded { .. } => "TIMEOUT",
            Self::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::Reconstruction { origin, .. } => origin.code,
            Self::Task(_) => "TASK_FAILED",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether a probe request should answer `null` instead of failing
    #[must_use]
    pub const fn is_missing_data(&self) -> bool {
        match self {
            Self::Reconstruction { origin, .. } => origin.missing_data,
            _ => matches!(self, Self::NotFound { .. } | Self::CorruptRecord { .. }),
        }
    }

    /// Client-visible class of this error, detached from its payload
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        ErrorClass {
            status_code: self.status_code(),
            code: self.code(),
            missing_data: self.is_missing_data(),
        }
    }
}

/// How an error presents to clients; shared with callers that did not
/// observe the error themselves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClass {
    pub status_code: u16,
    pub code: &'static str,
    pub missing_data: bool,
}

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;
