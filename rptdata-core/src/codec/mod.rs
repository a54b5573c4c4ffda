//! Bridge to the external decode service
//!
//! Raw message batches are published on a [`DecodeChannel`]; decoded batches
//! come back as unsolicited [`Delivery`] values and are matched to waiting
//! callers by [`MessageId`].

pub mod correlator;
pub mod loopback;

pub use correlator::{DecodeCorrelator, DeliveryOutcome};
pub use loopback::LoopbackChannel;

use crate::error::Result;
use async_trait::async_trait;
use rptdata_storage::{MessageId, StoredMessage};
use serde::{Deserialize, Serialize};

/// Raw messages from one stream sent for decoding together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessageBatch {
    pub stream: String,
    pub messages: Vec<StoredMessage>,
}

impl RawMessageBatch {
    #[must_use]
    pub fn new(stream: impl Into<String>, messages: Vec<StoredMessage>) -> Self {
        Self {
            stream: stream.into(),
            messages,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// `(stream, first sequence, last sequence, count)` fields for log lines
    fn describe(&self) -> String {
        let first = self.messages.first().map(|m| &m.id);
        let last = self.messages.last().map(|m| m.id.sequence);
        format!(
            "(stream={} direction={} firstSeq={} lastSeq={} count={})",
            self.stream,
            first.map_or_else(|| "-".to_string(), |id| id.direction.to_string()),
            first.map_or_else(|| "-".to_string(), |id| id.sequence.to_string()),
            last.map_or_else(|| "-".to_string(), |seq| seq.to_string()),
            self.messages.len()
        )
    }
}

/// Codec output for one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedMessage {
    /// Identity the message was requested under
    pub id: MessageId,
    pub message_type: String,
    #[serde(default)]
    pub fields: serde_json::Value,
}

/// Body of an inbound delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedBatch {
    pub messages: Vec<DecodedMessage>,
}

/// One inbound message from the decode service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker delivery tag echoed back on acknowledgement
    pub tag: u64,
    pub body: Vec<u8>,
}

/// Outbound half of the decode service connection
#[async_trait]
pub trait DecodeChannel: Send + Sync {
    /// Publish a raw batch for decoding.
    async fn publish(&self, batch: &RawMessageBatch) -> Result<()>;

    /// Acknowledge an inbound delivery.
    async fn ack(&self, tag: u64) -> Result<()>;
}
