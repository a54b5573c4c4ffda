//! Reconstruction and deduplication behaviour of the event tree cache

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rptdata_core::cache::EventTreeCache;
use rptdata_core::event::{Event, EventPath};
use rptdata_storage::hot::HotStore;
use rptdata_storage::{
    EventBatch, EventId, MessageId, MessageQuery, StorageGateway, StoredEvent, StoredEventEntry,
    StoredMessage, TimeRange, UnwrappedEvent,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Hot store that counts point lookups and slows child enumeration down
struct CountingStore {
    inner: HotStore,
    lookups: AtomicUsize,
    child_reads: AtomicUsize,
}

impl CountingStore {
    fn new(inner: HotStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            lookups: AtomicUsize::new(0),
            child_reads: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StorageGateway for CountingStore {
    async fn get_event(&self, id: &EventId) -> rptdata_storage::Result<Option<StoredEventEntry>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get_event(id).await
    }

    async fn get_child_events(
        &self,
        parent_id: &EventId,
    ) -> rptdata_storage::Result<Vec<StoredEventEntry>> {
        self.child_reads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.get_child_events(parent_id).await
    }

    async fn get_events_in_range(
        &self,
        range: &TimeRange,
        parent_id: Option<&EventId>,
    ) -> rptdata_storage::Result<Vec<UnwrappedEvent>> {
        self.inner.get_events_in_range(range, parent_id).await
    }

    async fn get_messages_in_range(
        &self,
        query: &MessageQuery,
    ) -> rptdata_storage::Result<Vec<StoredMessage>> {
        self.inner.get_messages_in_range(query).await
    }

    async fn get_event_ids_for_message(
        &self,
        id: &MessageId,
    ) -> rptdata_storage::Result<Vec<EventId>> {
        self.inner.get_event_ids_for_message(id).await
    }

    async fn get_raw_message(
        &self,
        id: &MessageId,
    ) -> rptdata_storage::Result<Option<StoredMessage>> {
        self.inner.get_raw_message(id).await
    }

    async fn get_message_streams(&self) -> rptdata_storage::Result<Vec<String>> {
        self.inner.get_message_streams().await
    }
}

fn at(second: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + second, 0).unwrap()
}

fn record(id: &str, parent: Option<&str>, second: i64) -> StoredEvent {
    StoredEvent {
        id: EventId::from(id),
        parent_id: parent.map(EventId::from),
        name: format!("{id} step"),
        event_type: "step".into(),
        start_timestamp: at(second),
        end_timestamp: None,
        successful: true,
        content: format!("{{\"id\":\"{id}\"}}"),
    }
}

fn path(text: &str) -> EventPath {
    text.parse().unwrap()
}

/// root → A (standalone) → A's batch holding B (with child C) and D
fn tree() -> HotStore {
    let store = HotStore::new();
    store.store_entry(StoredEventEntry::Single(record("root", None, 0)));
    store.store_entry(StoredEventEntry::Single(record("A", Some("root"), 1)));
    store.store_entry(StoredEventEntry::Batch(EventBatch {
        id: EventId::from("A-batch"),
        parent_id: EventId::from("A"),
        events: vec![
            record("B", Some("A"), 4),
            record("C", Some("B"), 5),
            record("D", Some("A"), 2),
        ],
    }));
    store.store_entry(StoredEventEntry::Single(record("E", Some("A"), 3)));
    store
}

#[tokio::test]
async fn test_reconstructs_batched_child_and_caches_ancestor() {
    let store = CountingStore::new(tree());
    let cache = EventTreeCache::new(64, store.clone());

    let b = cache
        .get_or_reconstruct(&path("root/A/B"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.parent_id, Some(EventId::from("A")));
    assert_eq!(b.child_ids, vec![EventId::from("C")]);
    assert!(b.is_batched);

    // the whole batch below A was cached in the same pass
    let a = cache.cached(&path("root/A")).unwrap();
    assert!(!a.is_batched);
    assert_eq!(
        a.child_ids,
        vec![EventId::from("D"), EventId::from("E"), EventId::from("B")]
    );
    assert!(cache.cached(&path("root/A/B/C")).is_some());
    assert!(cache.cached(&path("root/A/D")).is_some());

    // a later hit does no I/O
    let lookups = store.lookups.load(Ordering::SeqCst);
    cache.get_or_reconstruct(&path("root/A/B/C")).await.unwrap().unwrap();
    assert_eq!(store.lookups.load(Ordering::SeqCst), lookups);
}

#[tokio::test]
async fn test_standalone_event_is_served_with_children() {
    let cache = EventTreeCache::new(64, Arc::new(tree()));
    let root = cache.get_or_reconstruct(&path("root")).await.unwrap().unwrap();
    assert_eq!(root.child_ids, vec![EventId::from("A")]);
    assert_eq!(root.body["id"], "root");
}

#[tokio::test]
async fn test_missing_leaf_below_known_ancestor_is_not_found() {
    let cache = EventTreeCache::new(64, Arc::new(tree()));
    assert!(
        cache
            .get_or_reconstruct(&path("root/A/missing"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_concurrent_requests_share_one_traversal() {
    let store = CountingStore::new(tree());
    let cache = Arc::new(EventTreeCache::new(64, store.clone()));

    let requests = (0..8).map(|_| {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get_or_reconstruct(&path("root/A/B")).await })
    });
    let results = futures::future::join_all(requests).await;

    let nodes: Vec<Arc<Event>> = results
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().unwrap())
        .collect();
    assert!(nodes.iter().all(|node| node == &nodes[0]));
    assert_eq!(store.child_reads.load(Ordering::SeqCst), 1);
    // B is not addressable, A is: two lookups for the one walk
    assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cached_entry_is_never_overwritten() {
    let cache = EventTreeCache::new(64, Arc::new(tree()));
    let target = path("root/A/B");

    let mut planted = Event::from_stored(&record("B", Some("A"), 4), true, Vec::new()).unwrap();
    planted.name = "planted".into();
    assert!(cache.put(target.clone(), planted));

    // reconstructing a sibling rebuilds the same batch, including B
    cache.get_or_reconstruct(&path("root/A/D")).await.unwrap().unwrap();
    let b = cache.get_or_reconstruct(&target).await.unwrap().unwrap();
    assert_eq!(b.name, "planted");
    assert!(b.child_ids.is_empty());
}

#[tokio::test]
async fn test_corrupt_requested_event_is_an_error() {
    let store = HotStore::new();
    let mut broken = record("X", None, 0);
    broken.content = "{not json".into();
    store.store_entry(StoredEventEntry::Single(broken));

    let cache = EventTreeCache::new(4, Arc::new(store));
    let err = cache.get_or_reconstruct(&path("X")).await.unwrap_err();
    assert_eq!(err.status_code(), 500);
}

#[tokio::test]
async fn test_concurrent_callers_share_corrupt_classification() {
    let store = HotStore::new();
    let mut broken = record("X", None, 0);
    broken.content = "{broken".into();
    store.store_entry(StoredEventEntry::Single(broken));

    let store = CountingStore::new(store);
    let cache = EventTreeCache::new(4, store.clone());
    let target = path("X");

    let (first, second) = tokio::join!(
        cache.get_or_reconstruct(&target),
        cache.get_or_reconstruct(&target)
    );
    let (first, second) = (first.unwrap_err(), second.unwrap_err());

    // one rebuild ran; the other caller only waited on it
    assert_eq!(store.child_reads.load(Ordering::SeqCst), 1);
    assert_eq!(first.class(), second.class());
    assert_eq!(second.code(), "CORRUPT_RECORD");
    assert_eq!(second.status_code(), 500);
    assert!(first.is_missing_data() && second.is_missing_data());
    assert_eq!(cache.pending_reconstructions(), 0);
}

#[tokio::test]
async fn test_abandoned_reconstruction_is_not_left_in_flight() {
    let store = CountingStore::new(tree());
    let cache = Arc::new(EventTreeCache::new(64, store.clone()));

    let request = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get_or_reconstruct(&path("root/A/B")).await })
    };
    // child enumeration takes 50ms, so the rebuild is still running here
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.pending_reconstructions(), 1);

    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());
    assert_eq!(cache.pending_reconstructions(), 0);

    // the path can still be served afterwards
    let b = cache
        .get_or_reconstruct(&path("root/A/B"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(b.id, EventId::from("B"));
    assert_eq!(cache.pending_reconstructions(), 0);
}
