//! Request/response multiplexing over the publish/subscribe decode channel

use super::{DecodeChannel, DecodedBatch, DecodedMessage, Delivery, RawMessageBatch};
use crate::error::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use rptdata_storage::MessageId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

/// What the listener did with an inbound delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// At least one message matched a waiting caller; the delivery was acked
    Acked { matched: usize },
    /// Nothing in the delivery was pending; left unacknowledged
    Ignored,
    /// Body could not be parsed; left unacknowledged
    Unparsable,
}

/// Matches decoded responses to pending decode calls by message identity
///
/// Callers racing on the same identifier share one publish; each caller still
/// owns an independent response channel.
pub struct DecodeCorrelator {
    channel: Option<Arc<dyn DecodeChannel>>,
    pending: DashMap<MessageId, Vec<oneshot::Sender<DecodedMessage>>>,
    response_timeout: Duration,
}

impl DecodeCorrelator {
    #[must_use]
    pub fn new(channel: Option<Arc<dyn DecodeChannel>>, response_timeout: Duration) -> Self {
        Self {
            channel,
            pending: DashMap::new(),
            response_timeout,
        }
    }

    /// Correlator with no decode connection; every call resolves empty
    #[must_use]
    pub fn disconnected() -> Self {
        Self::new(None, Duration::ZERO)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Identifiers still waiting for a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Decode a batch, returning the resolved messages in input order.
    ///
    /// Every identifier shares one deadline. Identifiers that do not resolve
    /// in time are left out of the result.
    ///
    /// # Errors
    ///
    /// Only a failed publish is an error; timeouts degrade to partial results.
    pub async fn decode(&self, batch: &RawMessageBatch) -> Result<Vec<DecodedMessage>> {
        let Some(channel) = self.channel.as_ref() else {
            debug!(batch = %batch.describe(), "No decode connection, skipping decode");
            return Ok(Vec::new());
        };
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = PendingGuard {
            pending: &self.pending,
            ids: batch.messages.iter().map(|m| m.id.clone()).collect(),
        };
        let mut receivers = Vec::with_capacity(batch.len());
        let mut needs_publish = false;

        for message in &batch.messages {
            let (tx, rx) = oneshot::channel();
            match self.pending.entry(message.id.clone()) {
                Entry::Occupied(mut waiters) => waiters.get_mut().push(tx),
                Entry::Vacant(slot) => {
                    slot.insert(vec![tx]);
                    needs_publish = true;
                }
            }
            receivers.push(rx);
        }

        if needs_publish {
            channel.publish(batch).await?;
            debug!(batch = %batch.describe(), "Decode request published");
        } else {
            debug!(batch = %batch.describe(), "Joined in-flight decode request");
        }

        let deadline = Instant::now() + self.response_timeout;
        let responses = join_all(receivers.into_iter().map(|rx| timeout_at(deadline, rx))).await;

        let total = responses.len();
        let decoded: Vec<DecodedMessage> = responses
            .into_iter()
            .filter_map(|response| response.ok()?.ok())
            .collect();

        if decoded.len() < total {
            warn!(
                batch = %batch.describe(),
                resolved = decoded.len(),
                timeout_ms = self.response_timeout.as_millis(),
                "Decode response timed out"
            );
        } else {
            debug!(batch = %batch.describe(), "Decode response received");
        }
        Ok(decoded)
    }

    /// Route one inbound delivery to its waiters.
    ///
    /// The delivery is acknowledged when at least one of its messages was
    /// pending, even if others were not.
    ///
    /// # Errors
    ///
    /// Returns an error when the acknowledgement itself fails.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<DeliveryOutcome> {
        let batch: DecodedBatch = match serde_json::from_slice(&delivery.body) {
            Ok(batch) => batch,
            Err(err) => {
                error!(tag = delivery.tag, error = %err, "Unable to parse decode delivery");
                return Ok(DeliveryOutcome::Unparsable);
            }
        };

        let mut matched = 0;
        for message in batch.messages {
            if let Some((_, waiters)) = self.pending.remove(&message.id) {
                matched += 1;
                for waiter in waiters {
                    // receiver gone means that caller already gave up
                    let _ = waiter.send(message.clone());
                }
            }
        }
        debug!(
            tag = delivery.tag,
            matched,
            remaining = self.pending.len(),
            "Decode delivery routed"
        );

        if matched == 0 {
            return Ok(DeliveryOutcome::Ignored);
        }
        if let Some(channel) = self.channel.as_ref() {
            channel.ack(delivery.tag).await?;
        }
        Ok(DeliveryOutcome::Acked { matched })
    }

    /// Consume deliveries until shutdown or until the delivery source closes
    pub fn spawn_listener(
        self: Arc<Self>,
        mut deliveries: mpsc::Receiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    delivery = deliveries.recv() => {
                        let Some(delivery) = delivery else {
                            warn!("Decode delivery source closed");
                            break;
                        };
                        if let Err(err) = self.handle_delivery(delivery).await {
                            warn!("failed to acknowledge decode delivery: {err}");
                        }
                    }
                }
            }
            info!("Decode listener stopped");
        })
    }
}

/// Drops pending senders whose caller has stopped waiting
struct PendingGuard<'a> {
    pending: &'a DashMap<MessageId, Vec<oneshot::Sender<DecodedMessage>>>,
    ids: Vec<MessageId>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.pending.remove_if_mut(id, |_, waiters| {
                waiters.retain(|waiter| !waiter.is_closed());
                waiters.is_empty()
            });
        }
    }
}
