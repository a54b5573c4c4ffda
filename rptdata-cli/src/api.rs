//! HTTP routes over the provider context
//!
//! Point lookups and bounded searches answer JSON; streaming searches answer
//! `text/event-stream` through [`crate::handlers::sse`].

use crate::handlers::sse::{stream_event_search, stream_message_search};
use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use rptdata_core::search::filter::{event_filters, find_filter, message_filters};
use rptdata_core::search::{
    EventSearchRequest, MessageSearchRequest, QueryParams, StreamSettings, search_events,
    search_messages,
};
use rptdata_core::{EventPath, ProviderContext, ProviderError};
use rptdata_storage::MessageId;
use serde::Serialize;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Query string as ordered key/value pairs; repeated keys are kept
type RawQuery = Query<Vec<(String, String)>>;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<ProviderContext>,
    pub cache_control: CacheControl,
    pub stream: StreamSettings,
    /// Frames buffered per streaming request
    pub queue_size: usize,
}

impl ApiState {
    #[must_use]
    pub const fn new(
        ctx: Arc<ProviderContext>,
        cache_control: CacheControl,
        stream: StreamSettings,
        queue_size: usize,
    ) -> Self {
        Self {
            ctx,
            cache_control,
            stream,
            queue_size,
        }
    }
}

/// How long clients may reuse a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// Immutable data: point lookups and complete search results
    NotModified,
    RarelyModified,
    FrequentlyModified,
    NoCache,
}

/// `max-age` per [`CacheClass`], in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheControl {
    pub not_modified_max_age_s: u64,
    pub rarely_modified_max_age_s: u64,
    pub frequently_modified_max_age_s: u64,
}

impl CacheControl {
    #[must_use]
    pub fn header(&self, class: CacheClass) -> HeaderValue {
        let max_age = match class {
            CacheClass::NotModified => self.not_modified_max_age_s,
            CacheClass::RarelyModified => self.rarely_modified_max_age_s,
            CacheClass::FrequentlyModified => self.frequently_modified_max_age_s,
            CacheClass::NoCache => return HeaderValue::from_static("no-cache"),
        };
        HeaderValue::from_str(&format!("public, max-age={max_age}"))
            .unwrap_or_else(|_| HeaderValue::from_static("no-cache"))
    }

    fn json<T: Serialize>(&self, class: CacheClass, body: &T) -> Response {
        ([(header::CACHE_CONTROL, self.header(class))], Json(body)).into_response()
    }
}

/// Provider failure rendered as `{"error":{"code","message"}}`
#[derive(Debug)]
pub struct ApiError(pub ProviderError);

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

/// Log start and finish of one request with its identifying detail
async fn observed<F>(route: &'static str, detail: String, handler: F) -> ApiResult
where
    F: Future<Output = ApiResult>,
{
    let started = Instant::now();
    info!(route, %detail, "Request started");
    let result = handler.await;
    let elapsed_ms = started.elapsed().as_millis();
    match &result {
        Ok(response) => {
            info!(route, %detail, status = response.status().as_u16(), elapsed_ms, "Request finished");
        }
        Err(ApiError(err)) => {
            error!(route, %detail, status = err.status_code(), elapsed_ms, error = %err, "Request failed");
        }
    }
    result
}

/// Under `probe`, missing or unreadable records answer `null` instead of failing
fn probe_or_fail(err: ProviderError, probe: bool) -> ApiResult {
    if probe && err.is_missing_data() {
        Ok(Json(Value::Null).into_response())
    } else {
        Err(err.into())
    }
}

async fn get_event(
    State(state): State<ApiState>,
    Path(raw_path): Path<String>,
    Query(query): RawQuery,
) -> ApiResult {
    let detail = raw_path.clone();
    observed("event", detail, async move {
        let params = QueryParams::new(query);
        let probe = params.flag("probe")?;
        let Ok(path) = raw_path.parse::<EventPath>();
        if path.is_empty() {
            return Err(ProviderError::InvalidRequest("event path is empty".into()).into());
        }

        match state.ctx.get_event(&path).await {
            Ok(event) => Ok(state.cache_control.json(CacheClass::NotModified, &*event)),
            Err(err) => probe_or_fail(err, probe),
        }
    })
    .await
}

async fn get_message(
    State(state): State<ApiState>,
    Path(raw_id): Path<String>,
    Query(query): RawQuery,
) -> ApiResult {
    let detail = raw_id.clone();
    observed("message", detail, async move {
        let params = QueryParams::new(query);
        let probe = params.flag("probe")?;
        let id = raw_id
            .parse::<MessageId>()
            .map_err(|err| ProviderError::InvalidRequest(err.to_string()))?;

        match state.ctx.get_message(&id).await {
            Ok(message) => Ok(state.cache_control.json(CacheClass::NotModified, &*message)),
            Err(err) => probe_or_fail(err, probe),
        }
    })
    .await
}

async fn get_message_streams(State(state): State<ApiState>) -> ApiResult {
    observed("messageStreams", String::new(), async move {
        let streams = state.ctx.get_message_streams().await?;
        Ok(state.cache_control.json(CacheClass::RarelyModified, &streams))
    })
    .await
}

async fn search_messages_handler(
    State(state): State<ApiState>,
    Query(query): RawQuery,
) -> ApiResult {
    let params = QueryParams::new(query);
    let detail = format!("{params:?}");
    observed("search/messages", detail, async move {
        let request = MessageSearchRequest::from_params(&params)?;
        let result = search_messages(&state.ctx, &request).await?;
        let class = if result.long_term_cacheable {
            CacheClass::NotModified
        } else {
            CacheClass::FrequentlyModified
        };
        Ok(state.cache_control.json(class, &result.items))
    })
    .await
}

async fn search_events_handler(
    State(state): State<ApiState>,
    Query(query): RawQuery,
) -> ApiResult {
    let params = QueryParams::new(query);
    let detail = format!("{params:?}");
    observed("search/events", detail, async move {
        let request = EventSearchRequest::from_params(&params)?;
        let result = search_events(&state.ctx, &request).await?;
        Ok(state
            .cache_control
            .json(CacheClass::FrequentlyModified, &result.items))
    })
    .await
}

async fn sse_messages_handler(State(state): State<ApiState>, Query(query): RawQuery) -> Response {
    stream_message_search(&state, QueryParams::new(query))
}

async fn sse_events_handler(State(state): State<ApiState>, Query(query): RawQuery) -> Response {
    stream_event_search(&state, QueryParams::new(query))
}

async fn list_message_filters(State(state): State<ApiState>) -> Response {
    state
        .cache_control
        .json(CacheClass::RarelyModified, &message_filters())
}

async fn list_event_filters(State(state): State<ApiState>) -> Response {
    state
        .cache_control
        .json(CacheClass::RarelyModified, &event_filters())
}

async fn describe_message_filter(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult {
    let info = find_filter(message_filters(), &name)
        .ok_or_else(|| ProviderError::not_found("filter", &name))?;
    Ok(state.cache_control.json(CacheClass::RarelyModified, info))
}

async fn describe_event_filter(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult {
    let info = find_filter(event_filters(), &name)
        .ok_or_else(|| ProviderError::not_found("filter", &name))?;
    Ok(state.cache_control.json(CacheClass::RarelyModified, info))
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let events = state.ctx.events().stats();
    let messages = state.ctx.messages().cache().stats();
    Json(json!({
        "status": "healthy",
        "decoder_connected": state.ctx.correlator().is_connected(),
        "pending_decodes": state.ctx.correlator().pending_count(),
        "pending_reconstructions": state.ctx.events().pending_reconstructions(),
        "event_cache": {
            "hits": events.hits(),
            "misses": events.misses(),
            "hit_rate": events.hit_rate(),
        },
        "message_cache": {
            "entries": state.ctx.messages().cache().len(),
            "hits": messages.hits(),
            "misses": messages.misses(),
            "hit_rate": messages.hit_rate(),
        },
    }))
}

/// Every route served by the binary
pub fn create_api_routes() -> Router<ApiState> {
    Router::new()
        .route("/event/{*path}", get(get_event))
        .route("/message/{id}", get(get_message))
        .route("/messageStreams", get(get_message_streams))
        .route("/search/messages", get(search_messages_handler))
        .route("/search/events", get(search_events_handler))
        .route("/search/sse/messages", get(sse_messages_handler))
        .route("/search/sse/events", get(sse_events_handler))
        .route("/filters/sse-messages", get(list_message_filters))
        .route("/filters/sse-messages/{name}", get(describe_message_filter))
        .route("/filters/sse-events", get(list_event_filters))
        .route("/filters/sse-events/{name}", get(describe_event_filter))
        .route("/health", get(health))
}
