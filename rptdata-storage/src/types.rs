//! Stored record model shared by every reader of the event/message store.
//!
//! Events are either stored standalone or folded into an [`EventBatch`] that
//! lives under a common parent. Messages are raw byte payloads addressed by a
//! `(stream, direction, sequence)` triple.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a stored test event
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates an identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Direction of a message relative to the recorded connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Inbound to the system under test
    First,
    /// Outbound from the system under test
    Second,
}

impl Direction {
    /// Canonical lowercase name used in identifiers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::First => "first",
            Self::Second => "second",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure to parse an identifier from its string form
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid identifier '{value}': {reason}")]
pub struct IdParseError {
    /// Text that failed to parse
    pub value: String,
    /// What was wrong with it
    pub reason: &'static str,
}

/// Identifier of a stored message: `stream:direction:sequence`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    /// Stream (session alias) the message was recorded on
    pub stream: String,
    /// Direction within the stream
    pub direction: Direction,
    /// Monotonic sequence number within `(stream, direction)`
    pub sequence: u64,
}

impl MessageId {
    /// Creates a message identifier.
    pub fn new(stream: impl Into<String>, direction: Direction, sequence: u64) -> Self {
        Self {
            stream: stream.into(),
            direction,
            sequence,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.stream, self.direction, self.sequence)
    }
}

impl FromStr for MessageId {
    type Err = IdParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| IdParseError {
            value: value.to_string(),
            reason,
        };

        // Stream names may themselves contain ':' so split from the right.
        let mut parts = value.rsplitn(3, ':');
        let sequence = parts.next().ok_or_else(|| invalid("missing sequence"))?;
        let direction = parts.next().ok_or_else(|| invalid("missing direction"))?;
        let stream = parts.next().ok_or_else(|| invalid("missing stream"))?;

        if stream.is_empty() {
            return Err(invalid("empty stream name"));
        }

        let direction = match direction {
            "first" => Direction::First,
            "second" => Direction::Second,
            _ => return Err(invalid("direction must be 'first' or 'second'")),
        };
        let sequence = sequence
            .parse::<u64>()
            .map_err(|_| invalid("sequence must be an unsigned integer"))?;

        Ok(Self::new(stream, direction, sequence))
    }
}

/// A single test event record as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    pub id: EventId,
    #[serde(default)]
    pub parent_id: Option<EventId>,
    pub name: String,
    #[serde(default)]
    pub event_type: String,
    pub start_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub end_timestamp: Option<DateTime<Utc>>,
    #[serde(default = "default_success")]
    pub successful: bool,
    /// Raw JSON body text; parsed lazily by readers
    #[serde(default)]
    pub content: String,
}

const fn default_success() -> bool {
    true
}

/// Several child events stored together under one parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBatch {
    pub id: EventId,
    pub parent_id: EventId,
    pub events: Vec<StoredEvent>,
}

/// What a point lookup or child enumeration returns: one event or a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoredEventEntry {
    Single(StoredEvent),
    Batch(EventBatch),
}

/// A flattened entry member together with how it was stored
#[derive(Debug, Clone, PartialEq)]
pub struct UnwrappedEvent {
    pub event: StoredEvent,
    pub is_batched: bool,
}

impl StoredEventEntry {
    /// Identifier of the entry itself (the batch id for batches).
    #[must_use]
    pub const fn id(&self) -> &EventId {
        match self {
            Self::Single(event) => &event.id,
            Self::Batch(batch) => &batch.id,
        }
    }

    /// Parent of the entry; a batch's members share the batch parent at top level.
    #[must_use]
    pub const fn parent_id(&self) -> Option<&EventId> {
        match self {
            Self::Single(event) => event.parent_id.as_ref(),
            Self::Batch(batch) => Some(&batch.parent_id),
        }
    }

    /// True when the entry is a standalone event rather than a batch.
    #[must_use]
    pub const fn is_single(&self) -> bool {
        matches!(self, Self::Single(_))
    }

    /// Flattens the entry into its member events.
    #[must_use]
    pub fn unwrap(self) -> Vec<UnwrappedEvent> {
        match self {
            Self::Single(event) => vec![UnwrappedEvent {
                event,
                is_batched: false,
            }],
            Self::Batch(batch) => batch
                .events
                .into_iter()
                .map(|event| UnwrappedEvent {
                    event,
                    is_batched: true,
                })
                .collect(),
        }
    }
}

/// Raw message as persisted, before any codec has seen it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl StoredMessage {
    /// Total ordering key within a stream.
    #[must_use]
    pub fn key(&self) -> MessageKey {
        MessageKey {
            timestamp: self.timestamp,
            direction: self.id.direction,
            sequence: self.id.sequence,
        }
    }
}

/// Ordering key of a message inside its stream: timestamp first, then id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageKey {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub sequence: u64,
}

/// Read order for range scans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// Page request against one message stream.
///
/// Both time bounds are inclusive. `after` is an exclusive cursor interpreted
/// in `order`, so feeding back the key of the last returned message yields the
/// next page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub stream: String,
    pub order: Order,
    pub time_from: Option<DateTime<Utc>>,
    pub time_to: Option<DateTime<Utc>>,
    pub after: Option<MessageKey>,
    pub limit: Option<usize>,
}

impl MessageQuery {
    /// Unbounded ascending scan of a stream.
    pub fn stream(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            order: Order::Ascending,
            time_from: None,
            time_to: None,
            after: None,
            limit: None,
        }
    }
}

/// Half-open time window `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn message_id_round_trips_through_display() {
        let id = MessageId::new("fix:client", Direction::Second, 42);
        assert_eq!(id.to_string(), "fix:client:second:42");
        assert_eq!("fix:client:second:42".parse::<MessageId>().unwrap(), id);
    }

    #[test]
    fn message_id_rejects_bad_direction() {
        let err = "stream:sideways:1".parse::<MessageId>().unwrap_err();
        assert_eq!(err.reason, "direction must be 'first' or 'second'");
    }

    #[test]
    fn message_id_rejects_missing_parts() {
        assert!("42".parse::<MessageId>().is_err());
        assert!(":first:1".parse::<MessageId>().is_err());
        assert!("s:first:x".parse::<MessageId>().is_err());
    }

    #[test]
    fn batch_unwraps_into_batched_members() {
        let member = StoredEvent {
            id: EventId::from("b"),
            parent_id: Some(EventId::from("a")),
            name: "member".into(),
            event_type: String::new(),
            start_timestamp: Utc::now(),
            end_timestamp: None,
            successful: true,
            content: String::new(),
        };
        let entry = StoredEventEntry::Batch(EventBatch {
            id: EventId::from("batch-1"),
            parent_id: EventId::from("a"),
            events: vec![member.clone()],
        });

        assert!(!entry.is_single());
        assert_eq!(entry.parent_id(), Some(&EventId::from("a")));
        let unwrapped = entry.unwrap();
        assert_eq!(unwrapped.len(), 1);
        assert!(unwrapped[0].is_batched);
        assert_eq!(unwrapped[0].event, member);
    }
}
