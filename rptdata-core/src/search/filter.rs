//! Typed search filters and their catalogue

use super::request::QueryParams;
use crate::message::Message;
use rptdata_storage::{EventId, StoredEvent};
use serde::Serialize;

/// Message predicates; an empty list means "no constraint"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Message must be attached to at least one of these events
    pub attached_event_ids: Vec<EventId>,
    /// Decoded message type must be one of these
    pub message_types: Vec<String>,
}

impl MessageFilter {
    #[must_use]
    pub fn from_params(params: &QueryParams) -> Self {
        Self {
            attached_event_ids: params
                .all("attachedEventId")
                .into_iter()
                .map(EventId::from)
                .collect(),
            message_types: params.all("messageType"),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attached_event_ids.is_empty() && self.message_types.is_empty()
    }

    /// Evaluating the filter needs the decoded message
    #[must_use]
    pub fn needs_decode(&self) -> bool {
        !self.message_types.is_empty()
    }

    #[must_use]
    pub fn matches_attachments(&self, attached: &[EventId]) -> bool {
        self.attached_event_ids.is_empty()
            || attached.iter().any(|id| self.attached_event_ids.contains(id))
    }

    #[must_use]
    pub fn matches_type(&self, message_type: &str) -> bool {
        self.message_types.is_empty() || self.message_types.iter().any(|t| t == message_type)
    }

    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        self.matches_attachments(&message.attached_event_ids)
            && self.matches_type(&message.message_type)
    }
}

/// Event predicates; an empty list means "no constraint"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Lowercased; an event matches when its name contains any of them
    pub names: Vec<String>,
    pub types: Vec<String>,
}

impl EventFilter {
    #[must_use]
    pub fn from_params(params: &QueryParams) -> Self {
        Self {
            names: params
                .all("name")
                .into_iter()
                .map(|name| name.to_lowercase())
                .collect(),
            types: params.all("type"),
        }
    }

    #[must_use]
    pub fn matches(&self, event: &StoredEvent) -> bool {
        let name_ok = self.names.is_empty() || {
            let name = event.name.to_lowercase();
            self.names.iter().any(|needle| name.contains(needle.as_str()))
        };
        let type_ok = self.types.is_empty() || self.types.iter().any(|t| *t == event.event_type);
        name_ok && type_ok
    }
}

/// Catalogue entry describing one supported filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilterInfo {
    pub name: &'static str,
    /// Query parameter that carries the filter values
    pub parameter: &'static str,
    pub hint: &'static str,
}

const MESSAGE_FILTERS: &[FilterInfo] = &[
    FilterInfo {
        name: "attachedEventIds",
        parameter: "attachedEventId",
        hint: "matches messages attached to any of the given event ids",
    },
    FilterInfo {
        name: "type",
        parameter: "messageType",
        hint: "matches messages whose decoded type equals one of the values",
    },
];

const EVENT_FILTERS: &[FilterInfo] = &[
    FilterInfo {
        name: "name",
        parameter: "name",
        hint: "matches events whose name contains one of the values, ignoring case",
    },
    FilterInfo {
        name: "type",
        parameter: "type",
        hint: "matches events whose type equals one of the values",
    },
];

#[must_use]
pub const fn message_filters() -> &'static [FilterInfo] {
    MESSAGE_FILTERS
}

#[must_use]
pub const fn event_filters() -> &'static [FilterInfo] {
    EVENT_FILTERS
}

/// Look up a catalogue entry by name
#[must_use]
pub fn find_filter(catalogue: &'static [FilterInfo], name: &str) -> Option<&'static FilterInfo> {
    catalogue.iter().find(|info| info.name == name)
}
