//! Read-side storage gateway for recorded test events and messages
//!
//! The backing store is append-only. Readers only need ordered range scans and
//! point lookups, which is all [`StorageGateway`] exposes. The [`hot`] module
//! provides an in-memory implementation used by the server binary and tests.

#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod fixtures;
pub mod hot;
pub mod types;

pub use types::{
    Direction, EventBatch, EventId, IdParseError, MessageId, MessageKey, MessageQuery, Order,
    StoredEvent, StoredEventEntry, StoredMessage, TimeRange, UnwrappedEvent,
};

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Storage errors surfaced to readers as-is; no retry happens at this layer
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend unavailable: {reason}\n  Suggestion: {suggestion}")]
    Unavailable { reason: String, suggestion: String },

    #[error("Stored record '{id}' is malformed: {detail}")]
    Corrupt { id: String, detail: String },

    #[error("Failed to read fixture file {}", path.display())]
    FixtureIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Fixture file {} is not valid: {source}", path.display())]
    FixtureFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    /// Helper to create `Unavailable` with a remediation hint
    pub fn unavailable(reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Point and range read access to the event/message store.
///
/// Every call returns data ordered by insertion time; ordering across calls is
/// the caller's concern.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Look up a standalone event or a batch by its own identifier.
    ///
    /// Events that only exist inside a batch are not addressable here.
    async fn get_event(&self, id: &EventId) -> Result<Option<StoredEventEntry>>;

    /// Entries (single events and batches) whose parent is `parent_id`.
    async fn get_child_events(&self, parent_id: &EventId) -> Result<Vec<StoredEventEntry>>;

    /// Flattened events started within `range`, ascending by start time.
    ///
    /// When `parent_id` is given only its direct children are returned.
    async fn get_events_in_range(
        &self,
        range: &TimeRange,
        parent_id: Option<&EventId>,
    ) -> Result<Vec<UnwrappedEvent>>;

    /// One page of raw messages from a single stream.
    async fn get_messages_in_range(&self, query: &MessageQuery) -> Result<Vec<StoredMessage>>;

    /// Identifiers of the events a message is attached to.
    async fn get_event_ids_for_message(&self, id: &MessageId) -> Result<Vec<EventId>>;

    /// Raw message by identifier.
    async fn get_raw_message(&self, id: &MessageId) -> Result<Option<StoredMessage>>;

    /// Names of every stream holding at least one message.
    async fn get_message_streams(&self) -> Result<Vec<String>>;
}
