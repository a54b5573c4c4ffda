//! In-memory store with concurrent access and ordered range scans

use crate::{
    EventId, MessageId, MessageKey, MessageQuery, Order, Result, StorageGateway, StoredEventEntry,
    StoredMessage, TimeRange, UnwrappedEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// Append-only in-memory event/message store
#[derive(Default)]
pub struct HotStore {
    /// Addressable entries (single events and batches) by their own id
    entries: DashMap<EventId, StoredEventEntry>,
    /// Entry ids by parent, in insertion order
    children: DashMap<EventId, Vec<EventId>>,
    /// Flattened events by `(start, id)` for range scans
    timeline: RwLock<BTreeMap<(DateTime<Utc>, EventId), UnwrappedEvent>>,
    /// Messages per stream ordered by [`MessageKey`]
    streams: RwLock<HashMap<String, BTreeMap<MessageKey, StoredMessage>>>,
    /// Point-lookup index from id to ordering key
    message_keys: DashMap<MessageId, MessageKey>,
    /// Message → attached event ids
    attachments: DashMap<MessageId, Vec<EventId>>,
}

impl HotStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event entry. Re-inserting an existing id is ignored.
    pub fn store_entry(&self, entry: StoredEventEntry) {
        let id = entry.id().clone();
        if self.entries.contains_key(&id) {
            return;
        }

        if let Some(parent) = entry.parent_id() {
            self.children
                .entry(parent.clone())
                .or_default()
                .push(id.clone());
        }

        {
            let mut timeline = self.timeline.write();
            for unwrapped in entry.clone().unwrap() {
                let key = (unwrapped.event.start_timestamp, unwrapped.event.id.clone());
                timeline.insert(key, unwrapped);
            }
        }

        self.entries.insert(id, entry);
    }

    /// Append a raw message together with the events it is attached to.
    pub fn store_message(&self, message: StoredMessage, attached_to: Vec<EventId>) {
        let key = message.key();
        let id = message.id.clone();
        if self.message_keys.contains_key(&id) {
            return;
        }

        self.streams
            .write()
            .entry(id.stream.clone())
            .or_default()
            .insert(key, message);
        if !attached_to.is_empty() {
            self.attachments.insert(id.clone(), attached_to);
        }
        self.message_keys.insert(id, key);
    }

    /// Number of addressable event entries
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of stored messages across all streams
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.message_keys.len()
    }
}

fn time_bounds(query: &MessageQuery) -> (Bound<MessageKey>, Bound<MessageKey>) {
    use crate::Direction;

    let lower = query.time_from.map_or(Bound::Unbounded, |from| {
        Bound::Included(MessageKey {
            timestamp: from,
            direction: Direction::First,
            sequence: 0,
        })
    });
    let upper = query.time_to.map_or(Bound::Unbounded, |to| {
        Bound::Included(MessageKey {
            timestamp: to,
            direction: Direction::Second,
            sequence: u64::MAX,
        })
    });

    match (query.order, query.after) {
        (_, None) => (lower, upper),
        (Order::Ascending, Some(after)) => (tighten_lower(lower, after), upper),
        (Order::Descending, Some(after)) => (lower, tighten_upper(upper, after)),
    }
}

fn tighten_lower(lower: Bound<MessageKey>, after: MessageKey) -> Bound<MessageKey> {
    match lower {
        Bound::Included(key) | Bound::Excluded(key) if key > after => lower,
        _ => Bound::Excluded(after),
    }
}

fn tighten_upper(upper: Bound<MessageKey>, before: MessageKey) -> Bound<MessageKey> {
    match upper {
        Bound::Included(key) | Bound::Excluded(key) if key < before => upper,
        _ => Bound::Excluded(before),
    }
}

fn is_empty_range(lower: &Bound<MessageKey>, upper: &Bound<MessageKey>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u)) => l >= u,
        _ => false,
    }
}

#[async_trait]
impl StorageGateway for HotStore {
    async fn get_event(&self, id: &EventId) -> Result<Option<StoredEventEntry>> {
        Ok(self.entries.get(id).map(|entry| entry.clone()))
    }

    async fn get_child_events(&self, parent_id: &EventId) -> Result<Vec<StoredEventEntry>> {
        let Some(ids) = self.children.get(parent_id).map(|ids| ids.clone()) else {
            return Ok(Vec::new());
        };

        Ok(ids
            .iter()
            .filter_map(|id| self.entries.get(id).map(|entry| entry.clone()))
            .collect())
    }

    async fn get_events_in_range(
        &self,
        range: &TimeRange,
        parent_id: Option<&EventId>,
    ) -> Result<Vec<UnwrappedEvent>> {
        if range.from >= range.to {
            return Ok(Vec::new());
        }

        let timeline = self.timeline.read();
        let lower = Bound::Included((range.from, EventId::new(String::new())));
        let upper = Bound::Excluded((range.to, EventId::new(String::new())));

        Ok(timeline
            .range((lower, upper))
            .map(|(_, unwrapped)| unwrapped)
            .filter(|unwrapped| {
                parent_id.is_none_or(|parent| unwrapped.event.parent_id.as_ref() == Some(parent))
            })
            .cloned()
            .collect())
    }

    async fn get_messages_in_range(&self, query: &MessageQuery) -> Result<Vec<StoredMessage>> {
        let streams = self.streams.read();
        let Some(stream) = streams.get(&query.stream) else {
            return Ok(Vec::new());
        };

        let (lower, upper) = time_bounds(query);
        if is_empty_range(&lower, &upper) {
            return Ok(Vec::new());
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        let range = stream.range((lower, upper)).map(|(_, message)| message.clone());
        let page = match query.order {
            Order::Ascending => range.take(limit).collect(),
            Order::Descending => range.rev().take(limit).collect(),
        };
        Ok(page)
    }

    async fn get_event_ids_for_message(&self, id: &MessageId) -> Result<Vec<EventId>> {
        Ok(self
            .attachments
            .get(id)
            .map(|ids| ids.clone())
            .unwrap_or_default())
    }

    async fn get_raw_message(&self, id: &MessageId) -> Result<Option<StoredMessage>> {
        let Some(key) = self.message_keys.get(id).map(|key| *key) else {
            return Ok(None);
        };

        Ok(self
            .streams
            .read()
            .get(&id.stream)
            .and_then(|stream| stream.get(&key).cloned()))
    }

    async fn get_message_streams(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.streams.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
