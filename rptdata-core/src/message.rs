//! Enriched messages and their assembly from raw records

use crate::cache::MessageCache;
use crate::codec::{DecodeCorrelator, DecodedMessage, RawMessageBatch};
use crate::error::{ProviderError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rptdata_storage::{Direction, EventId, MessageId, StorageGateway, StoredMessage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Message type reported when the codec gave no answer
pub const UNKNOWN_MESSAGE_TYPE: &str = "unknown";

/// Message as served to clients: raw body plus decode result and attachments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(with = "id_text")]
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub stream: String,
    pub direction: Direction,
    pub message_type: String,
    pub fields: Option<serde_json::Value>,
    pub body_base64: String,
    pub attached_event_ids: Vec<EventId>,
}

impl Message {
    #[must_use]
    pub fn new(
        raw: &StoredMessage,
        decoded: Option<DecodedMessage>,
        attached_event_ids: Vec<EventId>,
    ) -> Self {
        let (message_type, fields) = match decoded {
            Some(decoded) => (decoded.message_type, Some(decoded.fields)),
            None => (UNKNOWN_MESSAGE_TYPE.to_string(), None),
        };
        Self {
            message_id: raw.id.clone(),
            timestamp: raw.timestamp,
            stream: raw.id.stream.clone(),
            direction: raw.id.direction,
            message_type,
            fields,
            body_base64: STANDARD.encode(&raw.content),
            attached_event_ids,
        }
    }

    #[must_use]
    pub fn is_decoded(&self) -> bool {
        self.fields.is_some()
    }
}

mod id_text {
    use rptdata_storage::MessageId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &MessageId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MessageId, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Turns raw records into cached, enriched messages
pub struct MessageAssembler {
    cache: MessageCache,
    correlator: Arc<DecodeCorrelator>,
    storage: Arc<dyn StorageGateway>,
}

impl MessageAssembler {
    #[must_use]
    pub fn new(
        cache: MessageCache,
        correlator: Arc<DecodeCorrelator>,
        storage: Arc<dyn StorageGateway>,
    ) -> Self {
        Self {
            cache,
            correlator,
            storage,
        }
    }

    #[must_use]
    pub const fn cache(&self) -> &MessageCache {
        &self.cache
    }

    /// Point read of one message: cache hit, or raw lookup plus decode.
    ///
    /// # Errors
    ///
    /// [`ProviderError::NotFound`] when storage has no such message.
    pub async fn get_or_fetch(&self, id: &MessageId) -> Result<Arc<Message>> {
        if let Some(message) = self.cache.get(id) {
            return Ok(message);
        }
        let raw = self
            .storage
            .get_raw_message(id)
            .await?
            .ok_or_else(|| ProviderError::not_found("message", id))?;

        let mut assembled = self.assemble(vec![raw]).await?;
        assembled
            .pop()
            .ok_or_else(|| ProviderError::not_found("message", id))
    }

    /// Enrich `raw` messages, preserving input order.
    ///
    /// Misses are decoded one batch per stream. Only decoded messages are
    /// cached, so a later request can retry the codec.
    ///
    /// # Errors
    ///
    /// Storage errors from the attachment lookups propagate.
    pub async fn assemble(&self, raw: Vec<StoredMessage>) -> Result<Vec<Arc<Message>>> {
        let mut assembled: Vec<Option<Arc<Message>>> = Vec::with_capacity(raw.len());
        let mut misses: BTreeMap<String, Vec<(usize, StoredMessage)>> = BTreeMap::new();

        for (index, message) in raw.into_iter().enumerate() {
            let hit = self.cache.get(&message.id);
            if hit.is_none() {
                misses
                    .entry(message.id.stream.clone())
                    .or_default()
                    .push((index, message));
            }
            assembled.push(hit);
        }
        if misses.is_empty() {
            return Ok(assembled.into_iter().flatten().collect());
        }
        debug!(
            streams = misses.len(),
            misses = misses.values().map(Vec::len).sum::<usize>(),
            "Message cache misses"
        );

        let decoded = self.decode_groups(&misses).await;
        let pending: Vec<(usize, StoredMessage)> = misses.into_values().flatten().collect();
        let attachments = join_all(
            pending
                .iter()
                .map(|(_, message)| self.storage.get_event_ids_for_message(&message.id)),
        )
        .await;

        let mut decoded = decoded;
        for ((index, raw), attached) in pending.into_iter().zip(attachments) {
            let message = Arc::new(Message::new(&raw, decoded.remove(&raw.id), attached?));
            if message.is_decoded() {
                self.cache.put(raw.id.clone(), Arc::clone(&message));
            }
            assembled[index] = Some(message);
        }

        Ok(assembled.into_iter().flatten().collect())
    }

    async fn decode_groups(
        &self,
        groups: &BTreeMap<String, Vec<(usize, StoredMessage)>>,
    ) -> HashMap<MessageId, DecodedMessage> {
        let batches: Vec<RawMessageBatch> = groups
            .iter()
            .map(|(stream, messages)| {
                RawMessageBatch::new(
                    stream.clone(),
                    messages.iter().map(|(_, message)| message.clone()).collect(),
                )
            })
            .collect();

        let results = join_all(batches.iter().map(|batch| self.correlator.decode(batch))).await;

        let mut decoded = HashMap::new();
        for (batch, result) in batches.iter().zip(results) {
            match result {
                Ok(messages) => {
                    decoded.extend(messages.into_iter().map(|m| (m.id.clone(), m)));
                }
                Err(err) => {
                    warn!(stream = %batch.stream, error = %err, "Decode failed, serving raw messages");
                }
            }
        }
        decoded
    }
}
