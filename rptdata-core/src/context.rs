//! Long-lived service objects shared by every request

use crate::cache::{EventTreeCache, MessageCache};
use crate::codec::DecodeCorrelator;
use crate::error::{ProviderError, Result};
use crate::event::{Event, EventPath};
use crate::message::{Message, MessageAssembler};
use rptdata_storage::{MessageId, StorageGateway};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Search tuning shared by all requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchSettings {
    /// End-to-end deadline of bounded searches
    pub request_timeout: Duration,
    /// Width of each time window scanned by streaming event searches
    pub sse_event_search_step: Duration,
    /// Raw messages fetched per stream and round trip
    pub message_page_size: usize,
    /// How far back a `previous` event scan goes when no end is given
    pub event_lookback: Duration,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(5_000),
            sse_event_search_step: Duration::from_secs(3_600),
            message_page_size: 100,
            event_lookback: Duration::from_secs(86_400),
        }
    }
}

/// Cache capacities in entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSizes {
    pub events: usize,
    pub messages: usize,
}

impl Default for CacheSizes {
    fn default() -> Self {
        Self {
            events: 100_000,
            messages: 100_000,
        }
    }
}

/// Storage handle, caches and decode bridge, built once at startup
pub struct ProviderContext {
    storage: Arc<dyn StorageGateway>,
    events: EventTreeCache,
    messages: MessageAssembler,
    correlator: Arc<DecodeCorrelator>,
    settings: SearchSettings,
}

impl ProviderContext {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        correlator: Arc<DecodeCorrelator>,
        sizes: CacheSizes,
        settings: SearchSettings,
    ) -> Self {
        Self {
            events: EventTreeCache::new(sizes.events, Arc::clone(&storage)),
            messages: MessageAssembler::new(
                MessageCache::new(sizes.messages),
                Arc::clone(&correlator),
                Arc::clone(&storage),
            ),
            storage,
            correlator,
            settings,
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageGateway> {
        &self.storage
    }

    #[must_use]
    pub const fn events(&self) -> &EventTreeCache {
        &self.events
    }

    #[must_use]
    pub const fn messages(&self) -> &MessageAssembler {
        &self.messages
    }

    #[must_use]
    pub fn correlator(&self) -> &Arc<DecodeCorrelator> {
        &self.correlator
    }

    #[must_use]
    pub const fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Reconstructed event at `path`
    ///
    /// # Errors
    ///
    /// `NotFound` when no stored record matches; storage errors propagate.
    pub async fn get_event(&self, path: &EventPath) -> Result<Arc<Event>> {
        self.events
            .get_or_reconstruct(path)
            .await?
            .ok_or_else(|| ProviderError::not_found("event", path))
    }

    /// Enriched message by identifier
    ///
    /// # Errors
    ///
    /// `NotFound` when storage has no such message.
    pub async fn get_message(&self, id: &MessageId) -> Result<Arc<Message>> {
        self.messages.get_or_fetch(id).await
    }

    /// Stream names known to storage
    ///
    /// # Errors
    ///
    /// Storage errors propagate.
    pub async fn get_message_streams(&self) -> Result<Vec<String>> {
        let streams = self.storage.get_message_streams().await?;
        debug!(count = streams.len(), "Listed message streams");
        Ok(streams)
    }
}
