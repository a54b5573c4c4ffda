//! Event tree model: cache paths, reconstructed nodes and search projections

use crate::error::{ProviderError, Result};
use chrono::{DateTime, Utc};
use rptdata_storage::{EventId, StoredEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Root-to-node chain of event identifiers
///
/// Serialized as `a/b/c`. The same event reached through different ancestors
/// is a different cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EventPath(Vec<EventId>);

impl EventPath {
    /// Final segment, the event this path addresses
    #[must_use]
    pub fn last(&self) -> Option<&EventId> {
        self.0.last()
    }

    /// Path with the final segment removed; `None` for the empty path
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Path extended by one segment
    #[must_use]
    pub fn child(&self, id: EventId) -> Self {
        let mut segments = self.0.clone();
        segments.push(id);
        Self(segments)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for EventPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("/")?;
            }
            f.write_str(segment.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for EventPath {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(
            value
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(EventId::from)
                .collect(),
        ))
    }
}

/// Fully reconstructed event as cached and served by point lookups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub parent_id: Option<EventId>,
    pub name: String,
    pub event_type: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub successful: bool,
    pub is_batched: bool,
    /// Direct children ordered by ascending start timestamp
    pub child_ids: Vec<EventId>,
    pub body: serde_json::Value,
}

impl Event {
    /// Build a node from its stored record and its already-sorted children.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::CorruptRecord`] when the body is not valid JSON.
    pub fn from_stored(
        record: &StoredEvent,
        is_batched: bool,
        child_ids: Vec<EventId>,
    ) -> Result<Self> {
        let body = parse_body(record)?;
        Ok(Self {
            id: record.id.clone(),
            parent_id: record.parent_id.clone(),
            name: record.name.clone(),
            event_type: record.event_type.clone(),
            start_timestamp: record.start_timestamp,
            end_timestamp: record.end_timestamp,
            successful: record.successful,
            is_batched,
            child_ids,
            body,
        })
    }
}

fn parse_body(record: &StoredEvent) -> Result<serde_json::Value> {
    if record.content.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(&record.content).map_err(|err| ProviderError::CorruptRecord {
        id: record.id.to_string(),
        reason: err.to_string(),
    })
}

/// Lightweight event projection used in search results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTreeNode {
    pub id: EventId,
    pub parent_id: Option<EventId>,
    pub name: String,
    pub event_type: String,
    pub start_timestamp: DateTime<Utc>,
    pub successful: bool,
    pub is_batched: bool,
}

impl EventTreeNode {
    #[must_use]
    pub fn from_stored(record: &StoredEvent, is_batched: bool) -> Self {
        Self {
            id: record.id.clone(),
            parent_id: record.parent_id.clone(),
            name: record.name.clone(),
            event_type: record.event_type.clone(),
            start_timestamp: record.start_timestamp,
            successful: record.successful,
            is_batched,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(content: &str) -> StoredEvent {
        StoredEvent {
            id: EventId::from("e1"),
            parent_id: None,
            name: "login".into(),
            event_type: "action".into(),
            start_timestamp: Utc::now(),
            end_timestamp: None,
            successful: true,
            content: content.into(),
        }
    }

    #[test]
    fn path_parsing_ignores_empty_segments() {
        let path: EventPath = "/root//A/B/".parse().unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path.to_string(), "root/A/B");
        assert_eq!(path.last(), Some(&EventId::from("B")));
        assert_eq!(path.parent().unwrap().to_string(), "root/A");
    }

    #[test]
    fn empty_path_has_no_parent() {
        let path: EventPath = "".parse().unwrap();
        assert!(path.is_empty());
        assert!(path.last().is_none());
        assert!(path.parent().is_none());
    }

    #[test]
    fn event_body_is_parsed() {
        let event = Event::from_stored(&record("{\"ok\":1}"), false, Vec::new()).unwrap();
        assert_eq!(event.body["ok"], 1);

        let empty = Event::from_stored(&record(""), true, Vec::new()).unwrap();
        assert!(empty.body.is_null());
        assert!(empty.is_batched);
    }

    #[test]
    fn corrupt_body_is_reported() {
        let err = Event::from_stored(&record("{oops"), false, Vec::new()).unwrap_err();
        assert!(matches!(err, ProviderError::CorruptRecord { .. }));
    }
}
