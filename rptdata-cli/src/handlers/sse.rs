//! Streaming search endpoints
//!
//! Each request gets its own [`SseSink`]. The scan runs on a spawned task
//! under [`run_sse`]; the response body drains the sink's receiver, so a
//! client hanging up closes the receiver and the liveness watcher cancels
//! the scan.

use crate::api::{ApiState, CacheClass};
use axum::{
    http::header,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use futures::Stream;
use rptdata_core::search::{
    QueryParams, SseEvent, SseEventSearchRequest, SseMessageSearchRequest, SseSink,
    StreamOutcome, run_sse, search_events_sse, search_messages_sse,
};
use rptdata_core::{ProviderContext, Result};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

/// `GET /search/sse/messages`
pub fn stream_message_search(state: &ApiState, params: QueryParams) -> Response {
    let request = SseMessageSearchRequest::from_params(&params);
    spawn_stream(state, "sse/messages", params, move |ctx, sink| async move {
        search_messages_sse(&ctx, &request?, &sink).await
    })
}

/// `GET /search/sse/events`
pub fn stream_event_search(state: &ApiState, params: QueryParams) -> Response {
    let request = SseEventSearchRequest::from_params(&params);
    spawn_stream(state, "sse/events", params, move |ctx, sink| async move {
        search_events_sse(&ctx, &request?, &sink).await
    })
}

/// Start `scan` in the background and answer with its frame stream.
///
/// A request that fails to parse still opens the stream; the failure arrives
/// as an `error` frame followed by `close`.
fn spawn_stream<F, Fut>(
    state: &ApiState,
    route: &'static str,
    params: QueryParams,
    scan: F,
) -> Response
where
    F: FnOnce(Arc<ProviderContext>, Arc<SseSink>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (sink, frames) = SseSink::channel(state.queue_size);
    let ctx = Arc::clone(&state.ctx);
    let settings = state.stream;

    tokio::spawn(async move {
        info!(route, params = ?params, "Streaming search started");
        let scan = scan(ctx, Arc::clone(&sink));
        match run_sse(sink, settings, scan).await {
            StreamOutcome::Failed(status) => {
                warn!(route, params = ?params, status, "Streaming search ended with error");
            }
            outcome => info!(route, params = ?params, ?outcome, "Streaming search finished"),
        }
    });

    (
        [(header::CACHE_CONTROL, state.cache_control.header(CacheClass::NoCache))],
        Sse::new(frame_stream(frames)),
    )
        .into_response()
}

fn frame_stream(
    frames: tokio::sync::mpsc::Receiver<SseEvent>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    ReceiverStream::new(frames).map(|frame| Ok(to_wire(frame)))
}

fn to_wire(frame: SseEvent) -> Event {
    let event = Event::default().event(frame.event.as_str()).data(frame.data);
    match frame.id {
        Some(id) => event.id(id.to_string()),
        None => event,
    }
}
