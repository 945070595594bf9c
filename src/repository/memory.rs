//! In-memory repository with change feeds and fault injection.
//!
//! Stands in for the remote backend in tests and demos. Documents are JSON
//! objects stamped with `_id`, `_rev`, `_createdAt` and `_updatedAt`.

use crate::error::{Result, SyncError};
use crate::subscriptions::SubscriptionManager;
use crate::types::{is_release_document_id, split_document_id, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::types::{
    ChangeFeed, FeedEvent, ListenOptions, MutationEvent, Patch, Query, Repository, Transition,
};

/// Default per-feed buffer.
const DEFAULT_FEED_BUFFER: usize = 1024;

/// Fields the repository owns; patches cannot touch them.
const SYSTEM_FIELDS: [&str; 4] = ["_id", "_rev", "_createdAt", "_updatedAt"];

/// Routing key for a feed subscription.
struct FeedRoute {
    query: Query,
    options: ListenOptions,
}

impl FeedRoute {
    fn accepts(&self, event: &FeedEvent) -> bool {
        if !self.options.wants(event.kind()) {
            return false;
        }
        match event {
            FeedEvent::Mutation(mutation) => self.query.matches_document(&mutation.document_id),
            FeedEvent::Welcome | FeedEvent::Reconnect => true,
        }
    }
}

/// Pending injected faults.
#[derive(Default)]
struct Faults {
    failing_fetches: u32,
    stalled_fetches: u32,
    stall: Duration,
    failing_listens: u32,
}

/// Document store evaluating the crate's closed query set.
pub struct InMemoryRepository {
    documents: RwLock<BTreeMap<String, Map<String, Value>>>,
    feeds: Arc<SubscriptionManager<FeedEvent, FeedRoute>>,
    next_rev: AtomicU64,
    fetch_log: Mutex<Vec<Query>>,
    faults: Mutex<Faults>,
}

impl InMemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::with_feed_buffer(DEFAULT_FEED_BUFFER)
    }

    /// Create an empty repository with a custom per-feed buffer.
    pub fn with_feed_buffer(buffer_size: usize) -> Self {
        Self {
            documents: RwLock::new(BTreeMap::new()),
            feeds: Arc::new(SubscriptionManager::new(buffer_size)),
            next_rev: AtomicU64::new(1),
            fetch_log: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    // --- Inspection ---

    /// Every query passed to `fetch`, in order.
    pub fn fetch_log(&self) -> Vec<Query> {
        self.fetch_log.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_log.lock().len()
    }

    pub fn clear_fetch_log(&self) {
        self.fetch_log.lock().clear();
    }

    /// Number of open change feeds.
    pub fn feed_count(&self) -> usize {
        self.feeds.subscription_count()
    }

    /// Stored document, with system fields.
    pub fn get(&self, id: &str) -> Option<Value> {
        self.documents
            .read()
            .get(id)
            .map(|doc| Value::Object(doc.clone()))
    }

    // --- Fault injection ---

    /// The next `count` fetches fail with a transport error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.faults.lock().failing_fetches = count;
    }

    /// The next `count` fetches block for `delay` before answering.
    pub fn stall_next_fetches(&self, count: u32, delay: Duration) {
        let mut faults = self.faults.lock();
        faults.stalled_fetches = count;
        faults.stall = delay;
    }

    /// The next `count` listens fail with a transport error.
    pub fn fail_next_listens(&self, count: u32) {
        self.faults.lock().failing_listens = count;
    }

    // --- Transport simulation ---

    /// Push a raw event to every feed that accepts it.
    pub fn emit(&self, event: FeedEvent) -> usize {
        self.feeds.broadcast(|route| route.accepts(&event), event.clone())
    }

    /// Emit `reconnect` followed by `welcome` on every feed.
    pub fn simulate_reconnect(&self) {
        self.emit(FeedEvent::Reconnect);
        self.emit(FeedEvent::Welcome);
    }

    /// Close every feed from the server side.
    pub fn disconnect_feeds(&self) -> usize {
        self.feeds.clear()
    }

    /// Store a document without notifying feeds, as if the change happened
    /// while listeners were disconnected.
    pub fn put_silently(&self, id: &str, payload: Value) -> Result<Value> {
        let mut docs = self.documents.write();
        let created_at = docs
            .get(id)
            .and_then(|doc| doc.get("_createdAt").cloned());
        let mut doc = object_payload(id, payload)?;
        self.stamp(id, &mut doc, created_at);
        docs.insert(id.to_string(), doc.clone());
        Ok(Value::Object(doc))
    }

    /// Remove a document without notifying feeds.
    pub fn remove_silently(&self, id: &str) -> bool {
        self.documents.write().remove(id).is_some()
    }

    // --- Internals ---

    fn stamp(&self, id: &str, doc: &mut Map<String, Value>, created_at: Option<Value>) {
        let now = Timestamp::now().0;
        let rev = self.next_rev.fetch_add(1, Ordering::SeqCst);
        doc.insert("_id".into(), json!(id));
        doc.insert("_rev".into(), json!(rev));
        doc.insert("_createdAt".into(), created_at.unwrap_or_else(|| json!(now)));
        doc.insert("_updatedAt".into(), json!(now));
    }

    /// Broadcast a mutation, embedding the result only for feeds that asked.
    fn notify(&self, document_id: &str, transition: Transition, doc: Option<&Map<String, Value>>) {
        let with_result = FeedEvent::Mutation(MutationEvent {
            document_id: document_id.to_string(),
            transition,
            result: doc.map(|d| Value::Object(d.clone())),
        });
        let bare = FeedEvent::Mutation(MutationEvent {
            document_id: document_id.to_string(),
            transition,
            result: None,
        });

        self.feeds.broadcast(
            |route| route.options.include_result && route.accepts(&with_result),
            with_result.clone(),
        );
        self.feeds.broadcast(
            |route| !route.options.include_result && route.accepts(&bare),
            bare.clone(),
        );
    }

    fn take_fetch_fault(&self) -> Result<()> {
        let stall = {
            let mut faults = self.faults.lock();
            if faults.failing_fetches > 0 {
                faults.failing_fetches -= 1;
                return Err(SyncError::Transport("injected fetch failure".into()));
            }
            if faults.stalled_fetches > 0 {
                faults.stalled_fetches -= 1;
                Some(faults.stall)
            } else {
                None
            }
        };

        if let Some(delay) = stall {
            thread::sleep(delay);
        }
        Ok(())
    }

    fn evaluate(&self, query: &Query) -> Value {
        let docs = self.documents.read();
        match query {
            Query::AllReleases => Value::Array(
                docs.iter()
                    .filter(|(id, _)| is_release_document_id(id))
                    .map(|(_, doc)| Value::Object(doc.clone()))
                    .collect(),
            ),
            Query::ReleaseDocuments { .. } => Value::Array(
                docs.iter()
                    .filter(|(id, _)| query.matches_document(id))
                    .map(|(_, doc)| Value::Object(doc.clone()))
                    .collect(),
            ),
            Query::ReleaseMetadata { release_ids } => {
                let mut stats: HashMap<&str, (u64, Option<i64>)> = release_ids
                    .iter()
                    .map(|id| (id.as_str(), (0, None)))
                    .collect();

                for (id, doc) in docs.iter() {
                    if is_release_document_id(id) {
                        continue;
                    }
                    let Some(release_id) = split_document_id(id).release_id() else {
                        continue;
                    };
                    if let Some((count, last_edited)) = stats.get_mut(release_id) {
                        *count += 1;
                        let updated = doc.get("_updatedAt").and_then(Value::as_i64);
                        *last_edited = (*last_edited).max(updated);
                    }
                }

                let result: Map<String, Value> = stats
                    .into_iter()
                    .map(|(id, (count, last_edited))| {
                        (
                            id.to_string(),
                            json!({"documentCount": count, "lastEditedAt": last_edited}),
                        )
                    })
                    .collect();
                Value::Object(result)
            }
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository for InMemoryRepository {
    fn fetch(&self, query: &Query) -> Result<Value> {
        self.fetch_log.lock().push(query.clone());
        self.take_fetch_fault()?;
        Ok(self.evaluate(query))
    }

    fn listen(&self, query: &Query, options: &ListenOptions) -> Result<ChangeFeed> {
        {
            let mut faults = self.faults.lock();
            if faults.failing_listens > 0 {
                faults.failing_listens -= 1;
                return Err(SyncError::Transport("injected listen failure".into()));
            }
        }

        let handle = self.feeds.subscribe(FeedRoute {
            query: query.clone(),
            options: options.clone(),
        });
        if options.wants(FeedEvent::Welcome.kind()) {
            self.feeds.send_to(handle.id, FeedEvent::Welcome);
        }

        let feeds = Arc::downgrade(&self.feeds);
        let id = handle.id;
        Ok(ChangeFeed::new(id, handle.receiver, move || {
            if let Some(feeds) = feeds.upgrade() {
                feeds.unsubscribe(id);
            }
        }))
    }

    fn create(&self, id: &str, payload: Value) -> Result<Value> {
        let mut docs = self.documents.write();
        if docs.contains_key(id) {
            return Err(SyncError::DocumentExists(id.to_string()));
        }

        let mut doc = object_payload(id, payload)?;
        self.stamp(id, &mut doc, None);
        docs.insert(id.to_string(), doc.clone());
        self.notify(id, Transition::Appear, Some(&doc));
        Ok(Value::Object(doc))
    }

    fn patch(&self, id: &str, patch: Patch) -> Result<Value> {
        let mut docs = self.documents.write();
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| SyncError::DocumentNotFound(id.to_string()))?;

        for (field, value) in patch.set {
            if !SYSTEM_FIELDS.contains(&field.as_str()) {
                doc.insert(field, value);
            }
        }
        for field in patch.unset {
            if !SYSTEM_FIELDS.contains(&field.as_str()) {
                doc.remove(&field);
            }
        }

        let created_at = doc.get("_createdAt").cloned();
        self.stamp(id, doc, created_at);
        let doc = doc.clone();
        self.notify(id, Transition::Update, Some(&doc));
        Ok(Value::Object(doc))
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut docs = self.documents.write();
        if docs.remove(id).is_none() {
            return Err(SyncError::DocumentNotFound(id.to_string()));
        }
        self.notify(id, Transition::Disappear, None);
        Ok(())
    }
}

fn object_payload(id: &str, payload: Value) -> Result<Map<String, Value>> {
    match payload {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(SyncError::InvalidDocument(format!(
            "{id}: payload must be an object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::ListenEventKind;
    use crate::types::{release_document_id, Release, ReleaseMetadata};

    const WAIT: Duration = Duration::from_millis(200);

    #[test]
    fn test_create_stamps_system_fields() {
        let repo = InMemoryRepository::new();
        let doc = repo
            .create(&release_document_id("summer"), json!({"title": "Summer"}))
            .unwrap();

        let release: Release = serde_json::from_value(doc).unwrap();
        assert_eq!(release.id, "summer");
        assert_eq!(release.title, "Summer");
        assert!(release.revision > 0);
    }

    #[test]
    fn test_create_duplicate_fails() {
        let repo = InMemoryRepository::new();
        repo.create("doc-1", json!({})).unwrap();
        let result = repo.create("doc-1", json!({}));
        assert!(matches!(result, Err(SyncError::DocumentExists(_))));
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let repo = InMemoryRepository::new();
        let result = repo.create("doc-1", json!([1, 2]));
        assert!(matches!(result, Err(SyncError::InvalidDocument(_))));
    }

    #[test]
    fn test_patch_bumps_revision_and_keeps_created_at() {
        let repo = InMemoryRepository::new();
        let id = release_document_id("summer");
        let created = repo.create(&id, json!({"title": "Summer"})).unwrap();
        let patched = repo
            .patch(&id, Patch::new().set("title", "Summer 2").set("_rev", 0))
            .unwrap();

        assert_eq!(patched["title"], "Summer 2");
        assert!(patched["_rev"].as_u64() > created["_rev"].as_u64());
        assert_eq!(patched["_createdAt"], created["_createdAt"]);
    }

    #[test]
    fn test_patch_and_delete_missing() {
        let repo = InMemoryRepository::new();
        assert!(matches!(
            repo.patch("nope", Patch::new()),
            Err(SyncError::DocumentNotFound(_))
        ));
        assert!(matches!(
            repo.delete("nope"),
            Err(SyncError::DocumentNotFound(_))
        ));
    }

    #[test]
    fn test_all_releases_query() {
        let repo = InMemoryRepository::new();
        repo.create(&release_document_id("a"), json!({"title": "A"})).unwrap();
        repo.create(&release_document_id("b"), json!({"title": "B"})).unwrap();
        repo.create("a.doc-1", json!({})).unwrap();

        let value = repo.fetch(&Query::AllReleases).unwrap();
        let releases: Vec<Release> = serde_json::from_value(value).unwrap();
        let ids: Vec<_> = releases.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_metadata_query_counts_per_release() {
        let repo = InMemoryRepository::new();
        repo.create("a.doc-1", json!({})).unwrap();
        repo.create("a.doc-2", json!({})).unwrap();
        repo.create("b.doc-1", json!({})).unwrap();
        repo.create("doc-1", json!({})).unwrap();
        repo.create("drafts.doc-1", json!({})).unwrap();

        let value = repo.fetch(&Query::release_metadata(["a", "c"])).unwrap();
        let metadata: HashMap<String, ReleaseMetadata> = serde_json::from_value(value).unwrap();

        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["a"].document_count, 2);
        assert!(metadata["a"].last_edited_at.is_some());
        assert_eq!(metadata["c"], ReleaseMetadata::default());
        assert_eq!(repo.fetch_count(), 1);
    }

    #[test]
    fn test_listen_sends_welcome_then_matching_mutations() {
        let repo = InMemoryRepository::new();
        let feed = repo
            .listen(&Query::AllReleases, &ListenOptions::default())
            .unwrap();

        assert_eq!(feed.recv_timeout(WAIT).unwrap(), FeedEvent::Welcome);

        repo.create("summer.doc-1", json!({})).unwrap();
        repo.create(&release_document_id("summer"), json!({"title": "Summer"}))
            .unwrap();

        match feed.recv_timeout(WAIT).unwrap() {
            FeedEvent::Mutation(mutation) => {
                assert_eq!(mutation.document_id, "_.releases.summer");
                assert_eq!(mutation.transition, Transition::Appear);
                assert!(mutation.result.is_some());
            }
            other => panic!("Expected mutation, got {:?}", other),
        }
        assert!(feed.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_listen_returns_while_fetch_is_stalled() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.stall_next_fetches(1, Duration::from_millis(300));
        let stalled = {
            let repo = Arc::clone(&repo);
            thread::spawn(move || repo.fetch(&Query::AllReleases))
        };
        while repo.fetch_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let started = std::time::Instant::now();
        let feed = repo
            .listen(&Query::AllReleases, &ListenOptions::default())
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(feed.recv_timeout(Duration::ZERO).unwrap(), FeedEvent::Welcome);

        assert!(stalled.join().unwrap().is_ok());
    }

    #[test]
    fn test_listen_without_results() {
        let repo = InMemoryRepository::new();
        let options = ListenOptions {
            include_result: false,
            events: vec![ListenEventKind::Mutation],
        };
        let feed = repo.listen(&Query::release_documents(["a"]), &options).unwrap();

        repo.create("a.doc-1", json!({})).unwrap();
        match feed.recv_timeout(WAIT).unwrap() {
            FeedEvent::Mutation(mutation) => assert!(mutation.result.is_none()),
            other => panic!("Expected mutation, got {:?}", other),
        }
    }

    #[test]
    fn test_dropping_feed_unsubscribes() {
        let repo = InMemoryRepository::new();
        let feed = repo
            .listen(&Query::AllReleases, &ListenOptions::default())
            .unwrap();
        assert_eq!(repo.feed_count(), 1);

        drop(feed);
        assert_eq!(repo.feed_count(), 0);
    }

    #[test]
    fn test_fault_injection() {
        let repo = InMemoryRepository::new();
        repo.fail_next_fetches(1);
        assert!(matches!(
            repo.fetch(&Query::AllReleases),
            Err(SyncError::Transport(_))
        ));
        assert!(repo.fetch(&Query::AllReleases).is_ok());

        repo.fail_next_listens(1);
        assert!(repo
            .listen(&Query::AllReleases, &ListenOptions::default())
            .is_err());
        assert!(repo
            .listen(&Query::AllReleases, &ListenOptions::default())
            .is_ok());
    }

    #[test]
    fn test_silent_writes_do_not_notify() {
        let repo = InMemoryRepository::new();
        let feed = repo
            .listen(&Query::AllReleases, &ListenOptions::default())
            .unwrap();
        assert_eq!(feed.recv_timeout(WAIT).unwrap(), FeedEvent::Welcome);

        let id = release_document_id("quiet");
        repo.put_silently(&id, json!({"title": "Quiet"})).unwrap();
        assert!(repo.get(&id).is_some());
        assert!(feed.recv_timeout(Duration::from_millis(50)).is_err());

        assert!(repo.remove_silently(&id));
        assert!(repo.get(&id).is_none());
    }
}
