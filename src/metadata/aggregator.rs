//! Batched per-release metadata.
//!
//! The worker owns a change feed scoped to the tracked releases' documents.
//! Mutation events are buffered for one window, then a single aggregate
//! fetch covers every release they touched.

use crate::config::AggregatorConfig;
use crate::error::{Result, SyncError};
use crate::repository::{
    spawn_fetch, ChangeFeed, FeedEvent, FetchOutcome, ListenEventKind, ListenOptions, Query,
    Repository,
};
use crate::subscriptions::{SubscriptionHandle, SubscriptionManager};
use crate::types::{split_document_id, ReleaseMetadata};
use crossbeam_channel::{at, never, select, unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::listeners::ListenerCounts;

/// Metadata for the tracked releases.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataState {
    /// Latest known metadata by release id.
    pub data: HashMap<String, ReleaseMetadata>,
    /// Set from a tracked set change until the combined fetch for the
    /// latest set has settled.
    pub loading: bool,
}

/// State shared between the aggregator handle and its worker.
struct Shared {
    state: RwLock<Arc<MetadataState>>,
    write_lock: Mutex<()>,
    watchers: SubscriptionManager<Arc<MetadataState>>,
    disposed: AtomicBool,
    /// Generation of the latest tracked set request. Written under `write_lock`.
    generation: AtomicU64,
}

impl Shared {
    fn snapshot(&self) -> Arc<MetadataState> {
        Arc::clone(&self.state.read())
    }

    /// Copy, modify, swap and publish. Skipped once disposed.
    fn update(&self, f: impl FnOnce(&mut MetadataState)) {
        let _lock = self.write_lock.lock();
        self.publish(f);
    }

    /// Record a new tracked set and return its generation.
    fn request(&self, loading: bool) -> u64 {
        let _lock = self.write_lock.lock();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if loading {
            self.publish(|state| state.loading = true);
        }
        generation
    }

    /// Apply the result of work done for `generation`. `loading` is only
    /// cleared if no newer set has been requested since.
    fn settle(&self, generation: u64, f: impl FnOnce(&mut MetadataState)) {
        let _lock = self.write_lock.lock();
        let latest = self.generation.load(Ordering::SeqCst) == generation;
        self.publish(|state| {
            f(state);
            if latest {
                state.loading = false;
            }
        });
    }

    /// Caller holds `write_lock`.
    fn publish(&self, f: impl FnOnce(&mut MetadataState)) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        let mut next = MetadataState::clone(&self.snapshot());
        f(&mut next);
        let next = Arc::new(next);
        *self.state.write() = Arc::clone(&next);
        self.watchers.publish(next);
    }
}

/// A tracked set change, numbered so stale fetches can be told apart.
struct TrackRequest {
    generation: u64,
    ids: Vec<String>,
}

struct Worker {
    commands: Sender<TrackRequest>,
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Maintains `release id -> ReleaseMetadata` for a changing set of ids.
///
/// Failures are advisory: they are logged and the previous data is kept.
pub struct MetadataAggregator {
    repository: Arc<dyn Repository>,
    config: AggregatorConfig,
    listeners: Mutex<ListenerCounts>,
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl MetadataAggregator {
    pub fn new(repository: Arc<dyn Repository>, config: AggregatorConfig) -> Self {
        let shared = Arc::new(Shared {
            state: RwLock::new(Arc::new(MetadataState::default())),
            write_lock: Mutex::new(()),
            watchers: SubscriptionManager::new(config.subscriber_buffer),
            disposed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });

        Self {
            repository,
            config,
            listeners: Mutex::new(ListenerCounts::new()),
            shared,
            worker: None,
        }
    }

    /// Spawn the worker and hand it the ids tracked so far.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(SyncError::AlreadyStarted);
        }

        let (command_tx, command_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        self.shared.disposed.store(false, Ordering::SeqCst);

        let session = Session {
            repository: Arc::clone(&self.repository),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            commands: command_rx,
            shutdown: shutdown_rx,
            generation: self.shared.generation.load(Ordering::SeqCst),
            tracked: Vec::new(),
            feed: None,
            pending: BTreeSet::new(),
            buffered: 0,
            deadline: None,
            resync_on_welcome: false,
        };

        let handle = thread::Builder::new()
            .name("release-metadata".into())
            .spawn(move || session.run())?;

        self.worker = Some(Worker {
            commands: command_tx,
            shutdown: shutdown_tx,
            handle,
        });

        let listeners = self.listeners.lock();
        if !listeners.is_empty() {
            self.notify_worker(&listeners);
        }
        drop(listeners);
        info!("metadata aggregator started");
        Ok(())
    }

    /// Drop the feed and pending window, then join the worker.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        {
            let _lock = self.shared.write_lock.lock();
            self.shared.disposed.store(true, Ordering::SeqCst);
        }
        drop(worker.commands);
        drop(worker.shutdown);
        if worker.handle.join().is_err() {
            error!("metadata worker panicked");
        }
        info!("metadata aggregator stopped");
    }

    /// Register interest in `ids`, one reference each.
    pub fn add_listener_ids<S: AsRef<str>>(&self, ids: &[S]) {
        let mut listeners = self.listeners.lock();
        if listeners.add(ids) {
            self.notify_worker(&listeners);
        }
    }

    /// Release one reference to each of `ids`.
    pub fn remove_listener_ids<S: AsRef<str>>(&self, ids: &[S]) {
        let mut listeners = self.listeners.lock();
        if listeners.remove(ids) {
            self.notify_worker(&listeners);
        }
    }

    /// Ids with at least one reference, sorted.
    pub fn tracked_ids(&self) -> Vec<String> {
        self.listeners.lock().tracked()
    }

    pub fn snapshot(&self) -> Arc<MetadataState> {
        self.shared.snapshot()
    }

    /// Metadata for one release, if known.
    pub fn metadata(&self, release_id: &str) -> Option<ReleaseMetadata> {
        self.shared.snapshot().data.get(release_id).copied()
    }

    /// Receive every new metadata snapshot after this call.
    pub fn subscribe(&self) -> SubscriptionHandle<Arc<MetadataState>> {
        self.shared.watchers.subscribe(())
    }

    fn notify_worker(&self, listeners: &ListenerCounts) {
        let Some(worker) = &self.worker else {
            return;
        };
        let ids = listeners.tracked();
        let generation = self.shared.request(!ids.is_empty());
        if worker.commands.send(TrackRequest { generation, ids }).is_err() {
            warn!("metadata worker gone; tracked set change dropped");
        }
    }
}

impl Drop for MetadataAggregator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker-side state.
struct Session {
    repository: Arc<dyn Repository>,
    config: AggregatorConfig,
    shared: Arc<Shared>,
    commands: Receiver<TrackRequest>,
    shutdown: Receiver<()>,
    /// Generation of `tracked`.
    generation: u64,
    /// Sorted tracked ids the feed and data currently cover.
    tracked: Vec<String>,
    feed: Option<ChangeFeed>,
    /// Release ids touched during the current window.
    pending: BTreeSet<String>,
    buffered: usize,
    deadline: Option<Instant>,
    resync_on_welcome: bool,
}

impl Session {
    fn run(mut self) {
        let shutdown = self.shutdown.clone();
        let commands = self.commands.clone();

        loop {
            let events = self
                .feed
                .as_ref()
                .map(|feed| feed.receiver().clone())
                .unwrap_or_else(never);
            let timer = self.deadline.map(at).unwrap_or_else(never);

            select! {
                recv(shutdown) -> _ => break,
                recv(commands) -> msg => match msg {
                    Ok(request) => {
                        // Only the latest queued set matters
                        let latest = commands.try_iter().last().unwrap_or(request);
                        self.track(latest);
                    }
                    Err(_) => break,
                },
                recv(events) -> msg => match msg {
                    Ok(event) => self.handle(event),
                    Err(_) => self.reopen_feed(),
                },
                recv(timer) -> _ => self.flush(),
            }
        }

        debug!("metadata worker exiting");
    }

    fn track(&mut self, request: TrackRequest) {
        debug!(
            releases = request.ids.len(),
            generation = request.generation,
            "tracked release set changed"
        );
        self.generation = request.generation;
        self.tracked = request.ids;
        self.feed = None;
        self.pending.clear();
        self.buffered = 0;
        self.deadline = None;
        self.resync_on_welcome = false;

        if self.tracked.is_empty() {
            self.shared.settle(self.generation, |state| state.data.clear());
            return;
        }

        // Writes landing during the fetch are buffered by the feed
        self.open_feed();
        self.refresh_all();
    }

    /// Combined fetch over the tracked set, replacing all data.
    fn refresh_all(&mut self) {
        let result = self.fetch(Query::release_metadata(self.tracked.clone()));
        self.shared.settle(self.generation, |state| {
            if let Some(data) = result {
                state.data = data;
            }
        });
    }

    fn open_feed(&mut self) {
        let options = ListenOptions {
            include_result: false,
            events: vec![
                ListenEventKind::Welcome,
                ListenEventKind::Mutation,
                ListenEventKind::Reconnect,
            ],
        };
        match self
            .repository
            .listen(&Query::release_documents(self.tracked.clone()), &options)
        {
            Ok(feed) => {
                debug!(feed = feed.id.0, "metadata feed opened");
                self.feed = Some(feed);
            }
            Err(error) => warn!(%error, "metadata listen failed; data may go stale"),
        }
    }

    fn reopen_feed(&mut self) {
        warn!("metadata feed closed; reopening");
        self.feed = None;
        self.resync_on_welcome = true;
        self.open_feed();
    }

    fn handle(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Welcome => {
                if self.resync_on_welcome {
                    self.resync_on_welcome = false;
                    info!("metadata feed re-established; refreshing");
                    self.refresh_all();
                }
            }
            FeedEvent::Reconnect => {
                debug!("metadata feed reconnecting");
                self.resync_on_welcome = true;
                self.pending.clear();
                self.buffered = 0;
                self.deadline = None;
            }
            FeedEvent::Mutation(mutation) => {
                let Some(release_id) = split_document_id(&mutation.document_id).release_id()
                else {
                    return;
                };
                self.pending.insert(release_id.to_string());
                self.buffered += 1;
                if self.deadline.is_none() {
                    self.deadline = Some(Instant::now() + self.config.buffer_window());
                }
            }
        }
    }

    /// End of window: one fetch for every still-tracked release touched.
    fn flush(&mut self) {
        self.deadline = None;
        let buffered = std::mem::take(&mut self.buffered);
        let affected: Vec<String> = std::mem::take(&mut self.pending)
            .into_iter()
            .filter(|id| self.tracked.contains(id))
            .collect();

        debug!(events = buffered, releases = affected.len(), "flushing metadata window");
        if affected.is_empty() {
            return;
        }

        if let Some(update) = self.fetch(Query::release_metadata(affected)) {
            self.shared.update(|state| state.data.extend(update));
        }
    }

    fn fetch(&self, query: Query) -> Option<HashMap<String, ReleaseMetadata>> {
        let pending = match spawn_fetch(&self.repository, query, self.config.fetch_timeout()) {
            Ok(pending) => pending,
            Err(error) => {
                warn!(%error, "metadata fetch could not start");
                return None;
            }
        };

        match pending.wait(&self.shutdown) {
            FetchOutcome::Completed(Ok(value)) => {
                match serde_json::from_value::<Option<HashMap<String, ReleaseMetadata>>>(value) {
                    Ok(data) => Some(data.unwrap_or_default()),
                    Err(error) => {
                        warn!(%error, "undecodable metadata result; keeping previous");
                        None
                    }
                }
            }
            FetchOutcome::Completed(Err(error)) => {
                warn!(%error, "metadata fetch failed; keeping previous");
                None
            }
            FetchOutcome::Cancelled => None,
        }
    }
}
