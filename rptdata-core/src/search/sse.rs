//! Frame vocabulary of streaming searches

use crate::error::ProviderError;
use serde::Serialize;
use std::fmt;

/// Kind of a streamed frame, independent of wire framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SseEventType {
    Message,
    Event,
    Close,
    Error,
    KeepAlive,
    MessageIds,
}

impl SseEventType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Event => "event",
            Self::Close => "close",
            Self::Error => "error",
            Self::KeepAlive => "keep_alive",
            Self::MessageIds => "message_ids",
        }
    }
}

impl fmt::Display for SseEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on its way to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: SseEventType,
    /// JSON payload
    pub data: String,
    /// Monotonic frame counter for data-bearing frames
    pub id: Option<u64>,
}

/// Scan progress reported by keep-alive frames
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastScannedObjectInfo {
    pub id: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub scan_counter: u64,
}

/// Payload of an `error` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionInfo {
    pub exception_name: String,
    pub exception_cause: String,
    pub status_code: u16,
}

impl From<&ProviderError> for ExceptionInfo {
    fn from(err: &ProviderError) -> Self {
        Self {
            exception_name: err.code().to_string(),
            exception_cause: err.to_string(),
            status_code: err.status_code(),
        }
    }
}
