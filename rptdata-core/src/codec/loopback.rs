//! In-process decode channel
//!
//! Decodes published batches with a local function and feeds the responses
//! back as deliveries, the same way the external codec would. Used by the
//! `loopback-json` codec mode and by tests.

use super::{DecodeChannel, DecodedBatch, DecodedMessage, Delivery, RawMessageBatch};
use crate::error::{ProviderError, Result};
use crate::message::UNKNOWN_MESSAGE_TYPE;
use async_trait::async_trait;
use parking_lot::Mutex;
use rptdata_storage::StoredMessage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Decode function applied to each published message
pub type DecodeFn = Arc<dyn Fn(&StoredMessage) -> Option<DecodedMessage> + Send + Sync>;

/// Treat message bodies as JSON objects; `messageType` names the type
///
/// Returns `None` for bodies that are not JSON.
#[must_use]
pub fn json_decoder() -> DecodeFn {
    Arc::new(|message: &StoredMessage| {
        let fields: serde_json::Value = serde_json::from_slice(&message.content).ok()?;
        let message_type = fields
            .get("messageType")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(UNKNOWN_MESSAGE_TYPE)
            .to_string();
        Some(DecodedMessage {
            id: message.id.clone(),
            message_type,
            fields,
        })
    })
}

/// Answer for a message the decoder rejected: unknown type, raw body as text
fn undecodable(message: &StoredMessage) -> DecodedMessage {
    DecodedMessage {
        id: message.id.clone(),
        message_type: UNKNOWN_MESSAGE_TYPE.to_string(),
        fields: serde_json::Value::String(String::from_utf8_lossy(&message.content).into_owned()),
    }
}

pub struct LoopbackChannel {
    deliveries: mpsc::Sender<Delivery>,
    decoder: DecodeFn,
    silent: AtomicBool,
    next_tag: AtomicU64,
    published: AtomicUsize,
    acked: Mutex<Vec<u64>>,
}

impl LoopbackChannel {
    /// Create the channel and the delivery stream a listener should consume
    #[must_use]
    pub fn new(decoder: DecodeFn, buffer: usize) -> (Arc<Self>, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let channel = Arc::new(Self {
            deliveries: tx,
            decoder,
            silent: AtomicBool::new(false),
            next_tag: AtomicU64::new(1),
            published: AtomicUsize::new(0),
            acked: Mutex::new(Vec::new()),
        });
        (channel, rx)
    }

    /// JSON-decoding loopback
    #[must_use]
    pub fn json(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Delivery>) {
        Self::new(json_decoder(), buffer)
    }

    /// Accept publishes but never answer them
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }

    /// Number of batches published so far
    #[must_use]
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }

    /// Delivery tags acknowledged so far
    #[must_use]
    pub fn acked(&self) -> Vec<u64> {
        self.acked.lock().clone()
    }
}

#[async_trait]
impl DecodeChannel for LoopbackChannel {
    async fn publish(&self, batch: &RawMessageBatch) -> Result<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.silent.load(Ordering::Relaxed) {
            return Ok(());
        }

        let decoded = DecodedBatch {
            messages: batch
                .messages
                .iter()
                .map(|m| (self.decoder)(m).unwrap_or_else(|| undecodable(m)))
                .collect(),
        };
        let body = serde_json::to_vec(&decoded)
            .map_err(|err| ProviderError::UpstreamUnavailable(err.to_string()))?;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);

        self.deliveries
            .send(Delivery { tag, body })
            .await
            .map_err(|_| ProviderError::UpstreamUnavailable("delivery queue closed".into()))
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        self.acked.lock().push(tag);
        Ok(())
    }
}
