//! Search pipeline: bounded result sets and incremental streaming scans

pub mod events;
pub mod filter;
pub mod messages;
pub mod request;
pub mod sink;
pub mod sse;

pub use events::{EventSearchItem, search_events, search_events_sse};
pub use filter::{EventFilter, FilterInfo, MessageFilter};
pub use messages::{MessageSearchItem, search_messages, search_messages_sse};
pub use request::{
    EventSearchRequest, MessageSearchRequest, QueryParams, SseEventSearchRequest,
    SseMessageSearchRequest, TimeRelation,
};
pub use sink::{SseSink, StreamOutcome, StreamSettings, run_sse};
pub use sse::{LastScannedObjectInfo, SseEvent, SseEventType};

use crate::context::ProviderContext;
use crate::error::{ProviderError, Result};
use std::future::Future;
use std::time::Instant;
use tracing::warn;

/// Complete result of a bounded search
#[derive(Debug, Clone, PartialEq)]
pub struct BoundedSearch<T> {
    /// Most recent first
    pub items: Vec<T>,
    /// The result cannot change any more and may be cached by clients
    pub long_term_cacheable: bool,
}

async fn with_request_timeout<T>(
    ctx: &ProviderContext,
    operation: &'static str,
    search: impl Future<Output = Result<T>>,
) -> Result<T> {
    let started = Instant::now();
    let limit = ctx.settings().request_timeout;
    if let Ok(result) = tokio::time::timeout(limit, search).await {
        result
    } else {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        warn!(operation, elapsed_ms, "Bounded search timed out");
        Err(ProviderError::TimeoutExceeded {
            operation,
            elapsed_ms,
        })
    }
}
