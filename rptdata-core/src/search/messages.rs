//! Message searches: bounded and streaming

use super::request::{MessageSearchRequest, SseMessageSearchRequest, TimeRelation};
use super::sink::SseSink;
use super::{BoundedSearch, with_request_timeout};
use crate::context::ProviderContext;
use crate::error::{ProviderError, Result};
use crate::message::Message;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rptdata_storage::{MessageKey, MessageQuery, Order, StorageGateway, StoredMessage};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// One bounded-search result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageSearchItem {
    Id(String),
    Message(Arc<Message>),
}

/// Bounded message search, most recent first.
///
/// # Errors
///
/// `TimeoutExceeded` past the request deadline; storage errors propagate.
pub async fn search_messages(
    ctx: &ProviderContext,
    request: &MessageSearchRequest,
) -> Result<BoundedSearch<MessageSearchItem>> {
    let items = with_request_timeout(ctx, "message search", collect_messages(ctx, request)).await?;
    let long_term_cacheable =
        items.len() == request.limit || request.time_to.is_some_and(|to| to < Utc::now());
    Ok(BoundedSearch {
        items,
        long_term_cacheable,
    })
}

async fn resolve_streams(ctx: &ProviderContext, streams: &[String]) -> Result<Vec<String>> {
    if streams.is_empty() {
        ctx.get_message_streams().await
    } else {
        Ok(streams.to_vec())
    }
}

async fn collect_messages(
    ctx: &ProviderContext,
    request: &MessageSearchRequest,
) -> Result<Vec<MessageSearchItem>> {
    let streams = resolve_streams(ctx, &request.streams).await?;
    let filter = &request.filter;
    // without filters the overall top `limit` is within each stream's top `limit`
    let per_stream_limit = filter.is_empty().then_some(request.limit);

    let pages = join_all(streams.iter().map(|stream| {
        let query = MessageQuery {
            stream: stream.clone(),
            order: Order::Descending,
            time_from: request.time_from,
            time_to: request.time_to,
            after: None,
            limit: per_stream_limit,
        };
        let storage = ctx.storage();
        async move { storage.get_messages_in_range(&query).await }
    }))
    .await;

    let mut candidates = Vec::new();
    for page in pages {
        candidates.extend(page?);
    }
    candidates.sort_by_key(|message| Reverse(message.key()));
    debug!(
        streams = streams.len(),
        candidates = candidates.len(),
        "Collected message candidates"
    );

    if filter.needs_decode() {
        let assembled = ctx.messages().assemble(candidates).await?;
        return Ok(assembled
            .into_iter()
            .filter(|message| filter.matches(message))
            .take(request.limit)
            .map(|message| item(message, request.ids_only))
            .collect());
    }

    if !filter.attached_event_ids.is_empty() {
        let storage = ctx.storage();
        let attached = join_all(
            candidates
                .iter()
                .map(|message| storage.get_event_ids_for_message(&message.id)),
        )
        .await;
        let mut kept = Vec::with_capacity(candidates.len());
        for (message, attached) in candidates.into_iter().zip(attached) {
            if filter.matches_attachments(&attached?) {
                kept.push(message);
            }
        }
        candidates = kept;
    }
    candidates.truncate(request.limit);

    if request.ids_only {
        return Ok(candidates
            .into_iter()
            .map(|message| MessageSearchItem::Id(message.id.to_string()))
            .collect());
    }
    let assembled = ctx.messages().assemble(candidates).await?;
    Ok(assembled.into_iter().map(MessageSearchItem::Message).collect())
}

fn item(message: Arc<Message>, ids_only: bool) -> MessageSearchItem {
    if ids_only {
        MessageSearchItem::Id(message.message_id.to_string())
    } else {
        MessageSearchItem::Message(message)
    }
}

/// Paged read position within one stream
struct StreamCursor {
    query: MessageQuery,
    buffer: VecDeque<StoredMessage>,
    exhausted: bool,
    last_scanned: Option<String>,
}

impl StreamCursor {
    fn new(query: MessageQuery) -> Self {
        Self {
            query,
            buffer: VecDeque::new(),
            exhausted: false,
            last_scanned: None,
        }
    }

    fn needs_refill(&self) -> bool {
        self.buffer.is_empty() && !self.exhausted
    }

    async fn refill(&mut self, storage: &dyn StorageGateway, page_size: usize) -> Result<()> {
        self.query.limit = Some(page_size);
        let page = storage.get_messages_in_range(&self.query).await?;
        if page.len() < page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.query.after = Some(last.key());
        }
        self.buffer.extend(page);
        Ok(())
    }

    fn front_key(&self) -> Option<MessageKey> {
        self.buffer.front().map(StoredMessage::key)
    }
}

/// Pop up to `page_size` messages across all cursors in scan order
async fn next_page(
    storage: &dyn StorageGateway,
    cursors: &mut [StreamCursor],
    direction: TimeRelation,
    page_size: usize,
) -> Result<Vec<StoredMessage>> {
    let mut page = Vec::with_capacity(page_size);
    while page.len() < page_size {
        let refills = join_all(
            cursors
                .iter_mut()
                .filter(|cursor| cursor.needs_refill())
                .map(|cursor| cursor.refill(storage, page_size)),
        )
        .await;
        for refill in refills {
            refill?;
        }

        let candidates = cursors
            .iter()
            .enumerate()
            .filter_map(|(index, cursor)| cursor.front_key().map(|key| (index, key)));
        let next = match direction {
            TimeRelation::After => candidates.min_by_key(|(_, key)| *key),
            TimeRelation::Before => candidates.max_by_key(|(_, key)| *key),
        };
        let Some((index, _)) = next else {
            break;
        };
        if let Some(message) = cursors[index].buffer.pop_front() {
            page.push(message);
        }
    }
    Ok(page)
}

fn scan_bounds(
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    direction: TimeRelation,
) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>, Order) {
    match direction {
        TimeRelation::After => (Some(start), end, Order::Ascending),
        TimeRelation::Before => (end, Some(start), Order::Descending),
    }
}

/// Streaming message search merged across streams in scan order.
///
/// Ends with a `message_ids` frame naming the last scanned message of every
/// stream, usable as `resumeFromId`.
///
/// # Errors
///
/// `Cancelled` once the client is gone; `NotFound` for an unknown resume id;
/// storage errors propagate.
pub async fn search_messages_sse(
    ctx: &ProviderContext,
    request: &SseMessageSearchRequest,
    sink: &SseSink,
) -> Result<()> {
    let streams = resolve_streams(ctx, &request.streams).await?;
    let mut start = request.start_timestamp;
    let mut resume_key = None;

    if let Some(resume_id) = request.resume_from_id.as_ref() {
        let resumed = ctx
            .storage()
            .get_raw_message(resume_id)
            .await?
            .ok_or_else(|| ProviderError::not_found("message", resume_id))?;
        start = resumed.timestamp;
        resume_key = Some((resume_id.stream.clone(), resumed.key()));
    }

    let (time_from, time_to, order) = scan_bounds(start, request.end_timestamp, request.direction);
    let mut cursors: Vec<StreamCursor> = streams
        .iter()
        .map(|stream| {
            let after = resume_key
                .as_ref()
                .filter(|(resume_stream, _)| resume_stream == stream)
                .map(|(_, key)| *key);
            StreamCursor::new(MessageQuery {
                stream: stream.clone(),
                order,
                time_from,
                time_to,
                after,
                limit: None,
            })
        })
        .collect();

    debug!(
        streams = streams.len(),
        start = start.timestamp_millis(),
        limit = request.limit,
        "Starting streaming message search"
    );

    let page_size = ctx.settings().message_page_size.max(1);
    let mut emitted = 0;
    'scan: while emitted < request.limit {
        let page = next_page(ctx.storage().as_ref(), &mut cursors, request.direction, page_size).await?;
        if page.is_empty() {
            break;
        }

        for message in ctx.messages().assemble(page).await? {
            if let Some(cursor) = cursors
                .iter_mut()
                .find(|cursor| cursor.query.stream == message.stream)
            {
                cursor.last_scanned = Some(message.message_id.to_string());
            }
            sink.note_scanned_timestamp(message.timestamp);

            if request.filter.matches(&message) {
                sink.send_message(&message).await?;
                emitted += 1;
                if emitted >= request.limit {
                    break 'scan;
                }
            }
        }
    }

    let recap: BTreeMap<String, Option<String>> = cursors
        .into_iter()
        .map(|cursor| (cursor.query.stream, cursor.last_scanned))
        .collect();
    sink.send_message_ids(&recap).await?;
    debug!(emitted, "Streaming message search finished");
    Ok(())
}
