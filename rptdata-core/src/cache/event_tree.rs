//! Path-keyed event cache with on-demand tree reconstruction
//!
//! A cache miss walks the requested path toward the root until it meets an
//! entry that storage can address directly. Everything batched beneath that
//! ancestor is rebuilt in one pass and cached under its own path, since batch
//! membership and sibling order are only known from the full batch contents.

use super::bounded::{BoundedCache, CacheStats};
use crate::error::{ErrorClass, ProviderError, Result};
use crate::event::{Event, EventPath};
use dashmap::DashMap;
use rayon::prelude::*;
use rptdata_storage::{EventId, StorageGateway, StoredEvent, StoredEventEntry};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Outcome shared with every caller waiting on the same path
#[derive(Debug, Clone)]
enum Reconstruction {
    Done(Option<Arc<Event>>),
    Failed { reason: String, class: ErrorClass },
}

/// Drops the in-flight entry once its caller finishes or is cancelled
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<EventPath, Arc<OnceCell<Reconstruction>>>,
    path: &'a EventPath,
    cell: Arc<OnceCell<Reconstruction>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(self.path, |_, current| Arc::ptr_eq(current, &self.cell));
    }
}

/// Event cache that reconstructs misses from storage
pub struct EventTreeCache {
    cache: BoundedCache<EventPath, Arc<Event>>,
    in_flight: DashMap<EventPath, Arc<OnceCell<Reconstruction>>>,
    storage: Arc<dyn StorageGateway>,
}

impl EventTreeCache {
    #[must_use]
    pub fn new(capacity: usize, storage: Arc<dyn StorageGateway>) -> Self {
        Self {
            cache: BoundedCache::new(capacity),
            in_flight: DashMap::new(),
            storage,
        }
    }

    /// Cached node at `path`, without touching storage
    pub fn cached(&self, path: &EventPath) -> Option<Arc<Event>> {
        self.cache.get(path)
    }

    /// Cache `event` at `path` unless something is already there
    pub fn put(&self, path: EventPath, event: Event) -> bool {
        self.cache.put_if_absent(path, Arc::new(event))
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Paths currently being reconstructed
    #[must_use]
    pub fn pending_reconstructions(&self) -> usize {
        self.in_flight.len()
    }

    /// Return the node at `path`, reconstructing it from storage on a miss.
    ///
    /// Concurrent callers asking for the same path share one reconstruction.
    /// `Ok(None)` means no stored record corresponds to the path.
    ///
    /// # Errors
    ///
    /// Storage errors propagate unchanged to the caller that ran the
    /// reconstruction; callers that only waited on it receive
    /// [`ProviderError::Reconstruction`] with the same message and the same
    /// status, code and missing-data class.
    pub async fn get_or_reconstruct(&self, path: &EventPath) -> Result<Option<Arc<Event>>> {
        if let Some(event) = self.cache.get(path) {
            return Ok(Some(event));
        }
        debug!(path = %path, "Event cache miss");

        let cell = self.in_flight.entry(path.clone()).or_default().clone();
        let guard = InFlightGuard {
            in_flight: &self.in_flight,
            path,
            cell: Arc::clone(&cell),
        };
        let mut own_error = None;
        let slot = &mut own_error;

        let outcome = cell
            .get_or_init(move || async move {
                // another reconstruction may have landed while we queued
                if let Some(event) = self.cache.get(path) {
                    return Reconstruction::Done(Some(event));
                }
                match self.reconstruct(path).await {
                    Ok(found) => Reconstruction::Done(found),
                    Err(err) => {
                        let failed = Reconstruction::Failed {
                            reason: err.to_string(),
                            class: err.class(),
                        };
                        *slot = Some(err);
                        failed
                    }
                }
            })
            .await
            .clone();
        drop(guard);

        match outcome {
            Reconstruction::Done(found) => Ok(found),
            Reconstruction::Failed { reason, class } => Err(own_error.unwrap_or_else(|| {
                ProviderError::Reconstruction {
                    path: path.to_string(),
                    reason,
                    origin: class,
                }
            })),
        }
    }

    async fn reconstruct(&self, path: &EventPath) -> Result<Option<Arc<Event>>> {
        let mut prefix = path.clone();
        loop {
            let Some(id) = prefix.last().cloned() else {
                debug!(path = %path, "No stored ancestor on path");
                return Ok(None);
            };
            if let Some(entry) = self.storage.get_event(&id).await? {
                debug!(path = %path, ancestor = %id, "Found last stored ancestor");
                return self.rebuild_below(path, prefix, entry).await;
            }
            prefix = prefix.parent().unwrap_or_default();
        }
    }

    async fn rebuild_below(
        &self,
        requested: &EventPath,
        ancestor_path: EventPath,
        ancestor: StoredEventEntry,
    ) -> Result<Option<Arc<Event>>> {
        let ancestor_id = ancestor.id().clone();
        let unwrapped: Vec<_> = self
            .storage
            .get_child_events(&ancestor_id)
            .await?
            .into_iter()
            .flat_map(StoredEventEntry::unwrap)
            .collect();

        let mut direct: Vec<&StoredEvent> = unwrapped
            .iter()
            .map(|u| &u.event)
            .filter(|event| event.parent_id.as_ref() == Some(&ancestor_id))
            .collect();
        sort_chronologically(&mut direct);
        let direct_ids: Vec<EventId> = direct.iter().map(|event| event.id.clone()).collect();

        let batched: Vec<StoredEvent> = unwrapped
            .iter()
            .filter(|u| u.is_batched)
            .map(|u| u.event.clone())
            .collect();

        let subtree = {
            let ancestor_id = ancestor_id.clone();
            let ancestor_path = ancestor_path.clone();
            tokio::task::spawn_blocking(move || {
                build_subtree(&batched, &ancestor_id, &ancestor_path)
            })
            .await
            .map_err(|err| ProviderError::Task(err.to_string()))?
        };

        debug!(
            ancestor = %ancestor_id,
            nodes = subtree.nodes.len(),
            "Rebuilt batched subtree"
        );

        let mut found = None;
        for (node_path, event) in subtree.nodes {
            let is_requested = &node_path == requested;
            let cached = self.cache.get_or_insert(node_path, Arc::new(event));
            if is_requested {
                found = Some(cached);
            }
        }
        if let Some(err) = subtree.error {
            return Err(err);
        }

        if let StoredEventEntry::Single(record) = &ancestor {
            let is_requested = &ancestor_path == requested;
            match Event::from_stored(record, false, direct_ids) {
                Ok(event) => {
                    let cached = self.cache.get_or_insert(ancestor_path, Arc::new(event));
                    if is_requested {
                        found = Some(cached);
                    }
                }
                Err(err) if is_requested => return Err(err),
                Err(err) => warn!(ancestor = %ancestor_id, error = %err, "Skipping corrupt ancestor"),
            }
        }

        if found.is_none() {
            warn!(path = %requested, "No stored event matches path");
        }
        Ok(found)
    }
}

fn sort_chronologically(events: &mut [&StoredEvent]) {
    events.sort_by(|a, b| {
        a.start_timestamp
            .cmp(&b.start_timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[derive(Default)]
struct Subtree {
    nodes: Vec<(EventPath, Event)>,
    error: Option<ProviderError>,
}

impl Subtree {
    fn merge(mut self, other: Self) -> Self {
        self.nodes.extend(other.nodes);
        if self.error.is_none() {
            self.error = other.error;
        }
        self
    }

    fn failed(err: ProviderError) -> Self {
        Self {
            nodes: Vec::new(),
            error: Some(err),
        }
    }
}

/// Records indexed by parent, children already in chronological order
struct ChildIndex<'a> {
    by_parent: HashMap<&'a EventId, Vec<&'a StoredEvent>>,
    total: usize,
}

impl<'a> ChildIndex<'a> {
    fn new(records: &'a [StoredEvent]) -> Self {
        let mut by_parent: HashMap<&EventId, Vec<&StoredEvent>> = HashMap::new();
        for record in records {
            if let Some(parent) = record.parent_id.as_ref() {
                by_parent.entry(parent).or_default().push(record);
            }
        }
        for children in by_parent.values_mut() {
            sort_chronologically(children);
        }
        Self {
            by_parent,
            total: records.len(),
        }
    }

    fn children(&self, parent: &EventId) -> &[&'a StoredEvent] {
        match self.by_parent.get(parent) {
            Some(children) => children,
            None => &[],
        }
    }
}

/// Rebuild every batched node below `root`, one rayon task per branch.
///
/// The first failure stops sibling branches from starting new work; nodes that
/// were already built are still returned.
fn build_subtree(records: &[StoredEvent], root: &EventId, root_path: &EventPath) -> Subtree {
    let index = ChildIndex::new(records);
    let failed = AtomicBool::new(false);
    build_level(&index, root, root_path, index.total, &failed)
}

fn build_level(
    index: &ChildIndex<'_>,
    parent: &EventId,
    path: &EventPath,
    depth_left: usize,
    failed: &AtomicBool,
) -> Subtree {
    let children = index.children(parent);
    if children.is_empty() {
        return Subtree::default();
    }
    if depth_left == 0 {
        failed.store(true, Ordering::Relaxed);
        return Subtree::failed(ProviderError::CorruptRecord {
            id: parent.to_string(),
            reason: "cyclic parent chain inside batch".into(),
        });
    }

    children
        .par_iter()
        .map(|record| {
            if failed.load(Ordering::Relaxed) {
                return Subtree::default();
            }
            let child_ids = index
                .children(&record.id)
                .iter()
                .map(|child| child.id.clone())
                .collect();
            let node_path = path.child(record.id.clone());
            let event = match Event::from_stored(record, true, child_ids) {
                Ok(event) => event,
                Err(err) => {
                    failed.store(true, Ordering::Relaxed);
                    return Subtree::failed(err);
                }
            };

            let below = build_level(index, &record.id, &node_path, depth_left - 1, failed);
            Subtree {
                nodes: vec![(node_path, event)],
                error: None,
            }
            .merge(below)
        })
        .reduce(Subtree::default, Subtree::merge)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rptdata_storage::EventBatch;
    use rptdata_storage::hot::HotStore;

    fn record(id: &str, parent: Option<&str>, second: i64) -> StoredEvent {
        StoredEvent {
            id: EventId::from(id),
            parent_id: parent.map(EventId::from),
            name: id.to_uppercase(),
            event_type: "step".into(),
            start_timestamp: Utc.timestamp_opt(1_700_000_000 + second, 0).unwrap(),
            end_timestamp: None,
            successful: true,
            content: "{}".into(),
        }
    }

    fn path(text: &str) -> EventPath {
        text.parse().unwrap()
    }

    #[test]
    fn subtree_orders_children_by_start() {
        let records = vec![
            record("b", Some("a"), 5),
            record("c", Some("a"), 1),
            record("d", Some("b"), 7),
        ];
        let built = build_subtree(&records, &EventId::from("a"), &path("a"));
        assert!(built.error.is_none());

        let nodes: HashMap<String, Event> = built
            .nodes
            .into_iter()
            .map(|(p, e)| (p.to_string(), e))
            .collect();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes["a/b"].child_ids, vec![EventId::from("d")]);
        assert!(nodes.contains_key("a/b/d"));
        assert!(nodes["a/c"].child_ids.is_empty());
    }

    #[test]
    fn subtree_reports_corrupt_member() {
        let mut broken = record("x", Some("a"), 2);
        broken.content = "{".into();
        let built = build_subtree(&[broken], &EventId::from("a"), &path("a"));
        assert!(matches!(built.error, Some(ProviderError::CorruptRecord { .. })));
    }

    #[test]
    fn subtree_stops_on_parent_cycle() {
        let records = vec![record("p", Some("q"), 1), record("q", Some("p"), 2)];
        let built = build_subtree(&records, &EventId::from("p"), &path("p"));
        assert!(built.error.is_some());
    }

    #[tokio::test]
    async fn batched_child_of_single_parent_is_found() {
        let store = HotStore::new();
        store.store_entry(StoredEventEntry::Single(record("root", None, 0)));
        store.store_entry(StoredEventEntry::Single(record("A", Some("root"), 1)));
        store.store_entry(StoredEventEntry::Batch(EventBatch {
            id: EventId::from("A-batch"),
            parent_id: EventId::from("A"),
            events: vec![record("B", Some("A"), 3), record("B2", Some("A"), 2)],
        }));

        let cache = EventTreeCache::new(16, Arc::new(store));
        let node = cache
            .get_or_reconstruct(&path("root/A/B"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.id, EventId::from("B"));
        assert_eq!(node.parent_id, Some(EventId::from("A")));
        assert!(node.is_batched);

        let ancestor = cache.cached(&path("root/A")).unwrap();
        assert_eq!(
            ancestor.child_ids,
            vec![EventId::from("B2"), EventId::from("B")]
        );
        assert!(cache.cached(&path("root/A/B2")).is_some());
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let cache = EventTreeCache::new(4, Arc::new(HotStore::new()));
        assert!(cache.get_or_reconstruct(&path("x/y")).await.unwrap().is_none());
        assert!(cache.get_or_reconstruct(&path("")).await.unwrap().is_none());
    }
}
