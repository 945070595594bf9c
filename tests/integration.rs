//! End-to-end tests: engine, aggregator and resolver over one repository.

use release_sync::{
    AggregatorConfig, ChangeFeed, CurrentRelease, FeedEvent, InMemoryRepository, ListenOptions,
    MetadataAggregator, NavigationState, Patch, Perspective, PerspectiveResolver, Phase, Query,
    ReleaseCache, ReleaseDraft, ReleaseOperations, Repository, RouterState, SyncConfig,
    SyncEngine,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn fast_sync() -> SyncConfig {
    SyncConfig {
        fetch_timeout_ms: 200,
        max_retries: 2,
        retry_delay_ms: 10,
        ..SyncConfig::default()
    }
}

fn fast_metadata() -> AggregatorConfig {
    AggregatorConfig {
        buffer_window_ms: 200,
        fetch_timeout_ms: 500,
        ..AggregatorConfig::default()
    }
}

fn repository(memory: &Arc<InMemoryRepository>) -> Arc<dyn Repository> {
    memory.clone()
}

fn start_engine(memory: &Arc<InMemoryRepository>) -> (Arc<ReleaseCache>, SyncEngine) {
    start_engine_over(repository(memory))
}

fn start_engine_over(repository: Arc<dyn Repository>) -> (Arc<ReleaseCache>, SyncEngine) {
    init_logging();
    let config = fast_sync();
    let cache = Arc::new(ReleaseCache::from_config(&config));
    let mut engine = SyncEngine::new(repository, Arc::clone(&cache), config);
    engine.start().unwrap();
    assert!(wait_for(WAIT, || cache.snapshot().phase == Phase::Loaded));
    (cache, engine)
}

fn start_aggregator(memory: &Arc<InMemoryRepository>) -> MetadataAggregator {
    start_aggregator_over(repository(memory))
}

fn start_aggregator_over(repository: Arc<dyn Repository>) -> MetadataAggregator {
    init_logging();
    let mut aggregator = MetadataAggregator::new(repository, fast_metadata());
    aggregator.start().unwrap();
    aggregator
}

/// Repository that commits one extra write right after answering the
/// first fetch for `query`, while that fetch is still in flight.
struct LateWriter {
    inner: Arc<InMemoryRepository>,
    query: Query,
    id: String,
    payload: Value,
    written: AtomicBool,
}

impl LateWriter {
    fn new(inner: &Arc<InMemoryRepository>, query: Query, id: &str, payload: Value) -> Self {
        Self {
            inner: Arc::clone(inner),
            query,
            id: id.to_string(),
            payload,
            written: AtomicBool::new(false),
        }
    }
}

impl Repository for LateWriter {
    fn fetch(&self, query: &Query) -> release_sync::Result<Value> {
        let value = self.inner.fetch(query)?;
        if *query == self.query && !self.written.swap(true, Ordering::SeqCst) {
            self.inner.create(&self.id, self.payload.clone())?;
        }
        Ok(value)
    }

    fn listen(&self, query: &Query, options: &ListenOptions) -> release_sync::Result<ChangeFeed> {
        self.inner.listen(query, options)
    }

    fn create(&self, id: &str, payload: Value) -> release_sync::Result<Value> {
        self.inner.create(id, payload)
    }

    fn patch(&self, id: &str, patch: Patch) -> release_sync::Result<Value> {
        self.inner.patch(id, patch)
    }

    fn delete(&self, id: &str) -> release_sync::Result<()> {
        self.inner.delete(id)
    }
}

// --- Sync Engine ---

#[test]
fn test_operations_reach_cache_through_feed() {
    let memory = Arc::new(InMemoryRepository::new());
    let (cache, _engine) = start_engine(&memory);
    let ops = ReleaseOperations::new(repository(&memory));

    ops.create_release("summer", ReleaseDraft::titled("Summer"))
        .unwrap();
    assert!(wait_for(WAIT, || cache.snapshot().get("summer").is_some()));

    ops.update_release("summer", ReleaseDraft::titled("Summer Sale"))
        .unwrap();
    assert!(wait_for(WAIT, || {
        cache
            .snapshot()
            .get("summer")
            .is_some_and(|r| r.title == "Summer Sale")
    }));

    ops.archive("summer").unwrap();
    assert!(wait_for(WAIT, || cache.snapshot().archived_releases().len() == 1));

    ops.delete_release("summer").unwrap();
    assert!(wait_for(WAIT, || cache.snapshot().is_empty()));

    // Only the bootstrap fetch; everything else came from the feed
    assert_eq!(memory.fetch_count(), 1);
}

#[test]
fn test_cache_subscribers_see_every_snapshot() {
    let memory = Arc::new(InMemoryRepository::new());
    let (cache, _engine) = start_engine(&memory);
    let handle = cache.subscribe();

    ReleaseOperations::new(repository(&memory))
        .create_release("summer", ReleaseDraft::titled("Summer"))
        .unwrap();

    let state = handle.recv_timeout(WAIT).unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state.phase, Phase::Loaded);
}

#[test]
fn test_reconnect_triggers_single_refetch() {
    let memory = Arc::new(InMemoryRepository::new());
    let ops = ReleaseOperations::new(repository(&memory));
    ops.create_release("old", ReleaseDraft::titled("Old")).unwrap();

    let (cache, _engine) = start_engine(&memory);
    assert!(cache.snapshot().get("old").is_some());

    // Changes made while the feed was down
    memory.remove_silently("_.releases.old");
    memory
        .put_silently("_.releases.offline", json!({"title": "Offline"}))
        .unwrap();
    memory.clear_fetch_log();

    memory.simulate_reconnect();

    assert!(wait_for(WAIT, || {
        let state = cache.snapshot();
        state.phase == Phase::Loaded && state.get("offline").is_some()
    }));
    let state = cache.snapshot();
    assert!(state.get("old").is_none());
    assert_eq!(state.len(), 1);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(memory.fetch_log(), vec![Query::AllReleases]);
}

#[test]
fn test_mutations_before_welcome_are_superseded() {
    let memory = Arc::new(InMemoryRepository::new());
    let (cache, _engine) = start_engine(&memory);

    memory.emit(FeedEvent::Reconnect);
    assert!(wait_for(WAIT, || cache.snapshot().phase == Phase::Loading));

    ReleaseOperations::new(repository(&memory))
        .create_release("gap", ReleaseDraft::titled("Gap"))
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    assert!(cache.snapshot().get("gap").is_none());

    memory.emit(FeedEvent::Welcome);
    assert!(wait_for(WAIT, || {
        let state = cache.snapshot();
        state.phase == Phase::Loaded && state.get("gap").is_some()
    }));
}

#[test]
fn test_closed_feed_is_reopened() {
    let memory = Arc::new(InMemoryRepository::new());
    let (cache, _engine) = start_engine(&memory);
    assert_eq!(memory.feed_count(), 1);

    memory.disconnect_feeds();

    assert!(wait_for(WAIT, || memory.feed_count() == 1 && memory.fetch_count() == 2));
    assert!(wait_for(WAIT, || cache.snapshot().phase == Phase::Loaded));

    ReleaseOperations::new(repository(&memory))
        .create_release("after", ReleaseDraft::titled("After"))
        .unwrap();
    assert!(wait_for(WAIT, || cache.snapshot().get("after").is_some()));
}

#[test]
fn test_write_during_bootstrap_fetch_is_applied() {
    let memory = Arc::new(InMemoryRepository::new());
    let writer = LateWriter::new(
        &memory,
        Query::AllReleases,
        "_.releases.late",
        json!({"title": "Late"}),
    );

    let (cache, _engine) = start_engine_over(Arc::new(writer));

    // The snapshot predates the write; the feed carries it
    assert!(wait_for(WAIT, || cache.snapshot().get("late").is_some()));
    assert_eq!(cache.snapshot().phase, Phase::Loaded);
    assert_eq!(memory.fetch_count(), 1);
}

// --- Metadata Aggregator ---

#[test]
fn test_aggregator_coalesces_burst_into_one_fetch() {
    let memory = Arc::new(InMemoryRepository::new());
    let ops = ReleaseOperations::new(repository(&memory));
    let aggregator = start_aggregator(&memory);
    aggregator.add_listener_ids(&["a", "b", "c"]);
    assert!(wait_for(WAIT, || aggregator.snapshot().data.len() == 3));
    assert!(wait_for(WAIT, || memory.feed_count() == 1));
    memory.clear_fetch_log();

    // 5 events for 3 releases inside one window
    let versions = [
        ("a", "doc-1"),
        ("a", "doc-2"),
        ("b", "doc-1"),
        ("c", "doc-1"),
        ("c", "doc-2"),
    ];
    for (release, doc) in versions {
        ops.create_version(release, doc, json!({})).unwrap();
    }

    assert!(wait_for(WAIT, || memory.fetch_count() >= 1));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(
        memory.fetch_log(),
        vec![Query::release_metadata(["a", "b", "c"])]
    );

    assert!(wait_for(WAIT, || {
        aggregator.metadata("a").map(|m| m.document_count) == Some(2)
    }));
    assert_eq!(aggregator.metadata("b").map(|m| m.document_count), Some(1));
    assert_eq!(aggregator.metadata("c").map(|m| m.document_count), Some(2));
}

#[test]
fn test_aggregator_merge_preserves_untouched_ids() {
    let memory = Arc::new(InMemoryRepository::new());
    let ops = ReleaseOperations::new(repository(&memory));
    ops.create_version("b", "doc-1", json!({})).unwrap();

    let aggregator = start_aggregator(&memory);
    aggregator.add_listener_ids(&["a", "b"]);
    assert!(wait_for(WAIT, || aggregator.snapshot().data.len() == 2));
    assert!(wait_for(WAIT, || memory.feed_count() == 1));
    memory.clear_fetch_log();

    ops.create_version("a", "doc-1", json!({})).unwrap();

    assert!(wait_for(WAIT, || {
        aggregator.metadata("a").map(|m| m.document_count) == Some(1)
    }));
    assert_eq!(memory.fetch_log(), vec![Query::release_metadata(["a"])]);
    assert_eq!(aggregator.metadata("b").map(|m| m.document_count), Some(1));
}

#[test]
fn test_aggregator_reference_counting() {
    let memory = Arc::new(InMemoryRepository::new());
    let aggregator = start_aggregator(&memory);

    // Two independent callers interested in the same release
    aggregator.add_listener_ids(&["a"]);
    aggregator.add_listener_ids(&["a"]);
    assert!(wait_for(WAIT, || aggregator.metadata("a").is_some()));
    let fetches = memory.fetch_count();

    aggregator.remove_listener_ids(&["a"]);
    assert_eq!(aggregator.tracked_ids(), vec!["a".to_string()]);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(memory.fetch_count(), fetches);
    assert_eq!(memory.feed_count(), 1);

    aggregator.remove_listener_ids(&["a"]);
    assert!(wait_for(WAIT, || aggregator.snapshot().data.is_empty()));
    assert!(wait_for(WAIT, || memory.feed_count() == 0));
}

#[test]
fn test_aggregator_refreshes_after_reconnect() {
    let memory = Arc::new(InMemoryRepository::new());
    let aggregator = start_aggregator(&memory);
    aggregator.add_listener_ids(&["a"]);
    assert!(wait_for(WAIT, || aggregator.metadata("a").is_some()));
    assert!(wait_for(WAIT, || memory.feed_count() == 1));

    memory.put_silently("a.doc-1", json!({})).unwrap();
    memory.clear_fetch_log();
    memory.simulate_reconnect();

    assert!(wait_for(WAIT, || {
        aggregator.metadata("a").map(|m| m.document_count) == Some(1)
    }));
    assert_eq!(memory.fetch_log(), vec![Query::release_metadata(["a"])]);
}

#[test]
fn test_version_operations_drive_document_count() {
    let memory = Arc::new(InMemoryRepository::new());
    let ops = ReleaseOperations::new(repository(&memory));
    ops.create_release("summer", ReleaseDraft::titled("Summer"))
        .unwrap();

    let aggregator = start_aggregator(&memory);
    aggregator.add_listener_ids(&["summer"]);
    assert!(wait_for(WAIT, || {
        aggregator.metadata("summer").map(|m| m.document_count) == Some(0)
    }));
    assert!(wait_for(WAIT, || memory.feed_count() == 1));

    ops.create_version("summer", "doc-1", json!({"title": "Beach"}))
        .unwrap();
    ops.create_version("summer", "doc-2", json!({"title": "Sun"}))
        .unwrap();
    assert!(wait_for(WAIT, || {
        aggregator.metadata("summer").map(|m| m.document_count) == Some(2)
    }));

    ops.discard_version("summer", "doc-1").unwrap();
    assert!(wait_for(WAIT, || {
        aggregator.metadata("summer").map(|m| m.document_count) == Some(1)
    }));
}

#[test]
fn test_write_during_initial_metadata_fetch_is_counted() {
    let memory = Arc::new(InMemoryRepository::new());
    ReleaseOperations::new(repository(&memory))
        .create_version("a", "doc-1", json!({}))
        .unwrap();
    let writer = LateWriter::new(
        &memory,
        Query::release_metadata(["a"]),
        "a.doc-2",
        json!({}),
    );

    let aggregator = start_aggregator_over(Arc::new(writer));
    aggregator.add_listener_ids(&["a"]);

    // The combined fetch saw one document; the feed reports the second
    assert!(wait_for(WAIT, || {
        aggregator.metadata("a").map(|m| m.document_count) == Some(2)
    }));
    assert_eq!(
        memory.fetch_log(),
        vec![Query::release_metadata(["a"]), Query::release_metadata(["a"])]
    );
}

// --- Perspective Resolver ---

#[test]
fn test_resolver_follows_cache() {
    let memory = Arc::new(InMemoryRepository::new());
    let (cache, _engine) = start_engine(&memory);
    let router = Arc::new(RouterState::with_param("release.summer"));
    let navigation: Arc<dyn NavigationState> = router.clone();
    let resolver = PerspectiveResolver::new(Arc::clone(&cache), navigation);

    // Not in the cache yet
    assert_eq!(resolver.current_release(), CurrentRelease::Latest);
    assert!(resolver.contains_document("doc-1"));

    let ops = ReleaseOperations::new(repository(&memory));
    ops.create_release("summer", ReleaseDraft::titled("Summer"))
        .unwrap();
    assert!(wait_for(WAIT, || !resolver.current_release().is_latest()));
    assert!(resolver.contains_document("summer.doc-1"));
    assert!(!resolver.contains_document("doc-1"));

    ops.delete_release("summer").unwrap();
    assert!(wait_for(WAIT, || resolver.current_release().is_latest()));

    // The stale link stays in navigation state
    assert_eq!(
        resolver.current_perspective(),
        Perspective::Release("summer".into())
    );
    resolver.set_perspective(Perspective::Latest);
    assert_eq!(router.perspective_param(), "");
}
