//! Memoization of enriched messages

use super::bounded::{BoundedCache, CacheStats};
use crate::message::Message;
use rptdata_storage::MessageId;
use std::sync::Arc;

/// Bounded id → message cache; no reconstruction logic
pub struct MessageCache {
    cache: BoundedCache<MessageId, Arc<Message>>,
}

impl MessageCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: BoundedCache::new(capacity),
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<Arc<Message>> {
        self.cache.get(id)
    }

    /// No-op when `id` is already cached
    pub fn put(&self, id: MessageId, message: Arc<Message>) -> bool {
        self.cache.put_if_absent(id, message)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
