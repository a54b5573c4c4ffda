//! HTTP surface driven through the router without a socket

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use chrono::{DateTime, TimeZone, Utc};
use rptdata_cli::Runtime;
use rptdata_cli::api::{ApiState, create_api_routes};
use rptdata_cli::config::{CliConfig, CodecMode};
use rptdata_core::codec::{DecodeCorrelator, LoopbackChannel};
use rptdata_core::{CacheSizes, ProviderContext, SearchSettings};
use rptdata_storage::hot::HotStore;
use rptdata_storage::{
    Direction, EventBatch, EventId, MessageId, StoredEvent, StoredEventEntry, StoredMessage,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // for `oneshot`

const BASE_MS: i64 = 1_704_067_200_000;

fn at(offset_s: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(BASE_MS + offset_s * 1_000).unwrap()
}

fn event(id: &str, parent: Option<&str>, offset_s: i64) -> StoredEvent {
    StoredEvent {
        id: EventId::from(id),
        parent_id: parent.map(EventId::from),
        name: format!("{id} step"),
        event_type: "action".into(),
        start_timestamp: at(offset_s),
        end_timestamp: None,
        successful: true,
        content: "{}".into(),
    }
}

fn seeded_store() -> HotStore {
    let store = HotStore::new();
    store.store_entry(StoredEventEntry::Single(event("root", None, 0)));
    store.store_entry(StoredEventEntry::Single(event("A", Some("root"), 1)));
    store.store_entry(StoredEventEntry::Batch(EventBatch {
        id: EventId::from("batch-1"),
        parent_id: EventId::from("A"),
        events: vec![event("b1", Some("A"), 2), event("b2", Some("A"), 3)],
    }));

    for seq in 1..=3_u64 {
        let body = format!("{{\"messageType\":\"Order\",\"seq\":{seq}}}");
        store.store_message(
            StoredMessage {
                id: MessageId::new("s1", Direction::First, seq),
                timestamp: at(i64::try_from(seq).unwrap() * 10),
                content: body.into_bytes(),
            },
            vec![EventId::from("A")],
        );
    }
    store
}

/// The runtime must outlive the router; dropping it stops the decode listener
fn create_test_router() -> (Runtime, Router) {
    let runtime = Runtime::with_storage(&CliConfig::default(), Arc::new(seeded_store()));
    let router = runtime.router();
    (runtime, router)
}

async fn send(app: &Router, uri: &str) -> Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    app.clone().oneshot(request).await.unwrap()
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Option<String>, Value) {
    let response = send(app, uri).await;
    let status = response.status();
    let cache_control = response
        .headers()
        .get(header::CACHE_CONTROL)
        .map(|value| value.to_str().unwrap().to_string());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, cache_control, serde_json::from_slice(&body).unwrap())
}

/// Collect `(event, data)` pairs from a complete SSE body
async fn read_frames(response: Response) -> Vec<(String, String)> {
    let body = tokio::time::timeout(
        Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .expect("stream should close")
    .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    text.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .map(|block| {
            let mut kind = String::new();
            let mut data = String::new();
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    kind = value.trim().to_string();
                } else if let Some(value) = line.strip_prefix("data:") {
                    data.push_str(value.trim());
                }
            }
            (kind, data)
        })
        .collect()
}

#[tokio::test]
async fn test_health_reports_decoder() {
    let (_runtime, app) = create_test_router();
    let (status, _, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["decoder_connected"], true);
    assert_eq!(body["pending_reconstructions"], 0);
}

#[tokio::test]
async fn test_event_lookup_by_path() {
    let (_runtime, app) = create_test_router();
    let (status, cache_control, body) = get_json(&app, "/event/root/A").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "A");
    assert_eq!(body["parentId"], "root");
    assert_eq!(cache_control.as_deref(), Some("public, max-age=86400"));
}

#[tokio::test]
async fn test_unknown_event_is_404_or_null_when_tolerated() {
    let (_runtime, app) = create_test_router();

    let (status, _, body) = get_json(&app, "/event/root/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let (status, _, body) = get_json(&app, "/event/root/missing?probe=true").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_null());
}

#[tokio::test]
async fn test_message_lookup_decodes_body() {
    let (_runtime, app) = create_test_router();
    let (status, _, body) = get_json(&app, "/message/s1:first:2").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["messageId"], "s1:first:2");
    assert_eq!(body["messageType"], "Order");
    assert_eq!(body["attachedEventIds"][0], "A");
}

#[tokio::test]
async fn test_malformed_message_id_is_400() {
    let (_runtime, app) = create_test_router();
    let (status, _, body) = get_json(&app, "/message/s1:sideways:1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_message_streams_are_rarely_modified() {
    let (_runtime, app) = create_test_router();
    let (status, cache_control, body) = get_json(&app, "/messageStreams").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!(["s1"]));
    assert_eq!(cache_control.as_deref(), Some("public, max-age=60"));
}

#[tokio::test]
async fn test_bounded_message_search_returns_latest_first() {
    let (_runtime, app) = create_test_router();
    let uri = format!(
        "/search/messages?timestampFrom={BASE_MS}&timestampTo={}&stream=s1&limit=2",
        BASE_MS + 60_000
    );
    let (status, cache_control, body) = get_json(&app, &uri).await;

    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|message| message["messageId"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["s1:first:3", "s1:first:2"]);
    assert_eq!(cache_control.as_deref(), Some("public, max-age=86400"));
}

#[tokio::test]
async fn test_bounded_message_search_ids_only() {
    let (_runtime, app) = create_test_router();
    let uri = format!("/search/messages?timestampFrom={BASE_MS}&stream=s1&idsOnly");
    let (status, _, body) = get_json(&app, &uri).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        serde_json::json!(["s1:first:3", "s1:first:2", "s1:first:1"])
    );
}

#[tokio::test]
async fn test_bounded_search_past_deadline_is_408() {
    let mut config = CliConfig::default();
    config.codec.mode = CodecMode::Disabled;
    let runtime = Runtime::with_storage(&config, Arc::new(seeded_store()));

    let (channel, _deliveries) = LoopbackChannel::json(16);
    channel.set_silent(true);
    let ctx = ProviderContext::new(
        Arc::new(seeded_store()),
        Arc::new(DecodeCorrelator::new(Some(channel), Duration::from_secs(5))),
        CacheSizes::default(),
        SearchSettings {
            request_timeout: Duration::from_millis(100),
            ..SearchSettings::default()
        },
    );
    let state = ApiState::new(
        Arc::new(ctx),
        runtime.state.cache_control,
        runtime.state.stream,
        runtime.state.queue_size,
    );
    let app = create_api_routes().with_state(state);

    let uri = format!("/search/messages?timestampFrom={BASE_MS}&stream=s1&messageType=Order");
    let (status, _, body) = tokio::time::timeout(Duration::from_secs(2), get_json(&app, &uri))
        .await
        .expect("answered before the codec timeout");

    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body["error"]["code"], "TIMEOUT");
}

#[tokio::test]
async fn test_event_search_requires_both_bounds() {
    let (_runtime, app) = create_test_router();
    let uri = format!("/search/events?timestampFrom={BASE_MS}");
    let (status, _, body) = get_json(&app, &uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_event_search_under_parent() {
    let (_runtime, app) = create_test_router();
    let uri = format!(
        "/search/events?timestampFrom={BASE_MS}&timestampTo={}&parentEvent=A",
        BASE_MS + 60_000
    );
    let (status, cache_control, body) = get_json(&app, &uri).await;

    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|node| node["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, ["b2", "b1"]);
    assert_eq!(cache_control.as_deref(), Some("public, max-age=1"));
}

#[tokio::test]
async fn test_sse_message_search_streams_frames() {
    let (_runtime, app) = create_test_router();
    let uri = format!(
        "/search/sse/messages?startTimestamp={BASE_MS}&endTimestamp={}&stream=s1",
        BASE_MS + 60_000
    );
    let response = send(&app, &uri).await;

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
    assert_eq!(content_type, "text/event-stream");
    assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-cache");

    let frames = read_frames(response).await;
    let kinds: Vec<&str> = frames.iter().map(|(kind, _)| kind.as_str()).collect();
    assert_eq!(kinds, ["message", "message", "message", "message_ids", "close"]);

    let recap: Value = serde_json::from_str(&frames[3].1).unwrap();
    assert_eq!(recap["messageIds"]["s1"], "s1:first:3");
}

#[tokio::test]
async fn test_sse_invalid_request_reports_error_frame() {
    let (_runtime, app) = create_test_router();
    let response = send(&app, "/search/sse/events?searchDirection=next").await;
    assert_eq!(response.status(), StatusCode::OK);

    let frames = read_frames(response).await;
    let kinds: Vec<&str> = frames.iter().map(|(kind, _)| kind.as_str()).collect();
    assert_eq!(kinds, ["error", "close"]);

    let error: Value = serde_json::from_str(&frames[0].1).unwrap();
    assert_eq!(error["statusCode"], 400);
}

#[tokio::test]
async fn test_sse_event_search_forward() {
    let (_runtime, app) = create_test_router();
    let uri = format!(
        "/search/sse/events?startTimestamp={BASE_MS}&endTimestamp={}",
        BASE_MS + 60_000
    );
    let frames = read_frames(send(&app, &uri).await).await;

    let names: Vec<String> = frames
        .iter()
        .filter(|(kind, _)| kind == "event")
        .map(|(_, data)| {
            let node: Value = serde_json::from_str(data).unwrap();
            node["id"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(names, ["root", "A", "b1", "b2"]);
    assert_eq!(frames.last().unwrap().0, "close");
}

#[tokio::test]
async fn test_filter_catalogue() {
    let (_runtime, app) = create_test_router();

    let (status, _, body) = get_json(&app, "/filters/sse-messages").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, _, body) = get_json(&app, "/filters/sse-events/name").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["parameter"], "name");

    let (status, _, body) = get_json(&app, "/filters/sse-events/colour").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}
