//! Release sync engine.
//!
//! Opens the change feed first and fetches the snapshot on its welcome, so
//! writes that land while the fetch is in flight queue on the feed and are
//! applied on top of the snapshot:
//!
//! ```text
//! Idle -> Connecting -> (welcome) -> Fetching -> Listening
//!           |  ^                       |  ^         |
//!           v  |                       v  |         | reconnect / feed closed
//!         Retrying                   Retrying       v
//!                                      |        Connecting
//!                                      v
//!                                    Failed   (terminal until restarted)
//! ```

use crate::cache::{CacheAction, ReleaseCache};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::repository::{
    spawn_fetch, ChangeFeed, FeedEvent, FetchOutcome, ListenOptions, MutationEvent, Query,
    Repository, Transition,
};
use crate::types::{release_id_from_document_id, Release};
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Connection state of the engine, independent of the cache phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Fetching { attempt: u32 },
    Retrying { attempt: u32 },
    Connecting,
    Listening,
    /// Terminal error surfaced; no automatic recovery.
    Failed,
    Stopped,
}

/// Why a session stopped early.
enum Halt {
    Shutdown,
    Failed(SyncError),
}

impl From<SyncError> for Halt {
    fn from(error: SyncError) -> Self {
        Halt::Failed(error)
    }
}

struct Worker {
    /// Dropped to signal shutdown.
    shutdown: Sender<()>,
    /// Held for reading across every dispatch; set under the write lock.
    disposed: Arc<RwLock<bool>>,
    handle: JoinHandle<()>,
}

/// Keeps a [`ReleaseCache`] an eventually-consistent mirror of the repository.
///
/// The engine is the cache's only writer. Construct it explicitly, share
/// the cache with readers, and drive it with [`start`](Self::start) and
/// [`stop`](Self::stop).
pub struct SyncEngine {
    repository: Arc<dyn Repository>,
    cache: Arc<ReleaseCache>,
    config: SyncConfig,
    status: Arc<RwLock<ConnectionState>>,
    worker: Option<Worker>,
}

impl SyncEngine {
    pub fn new(
        repository: Arc<dyn Repository>,
        cache: Arc<ReleaseCache>,
        config: SyncConfig,
    ) -> Self {
        Self {
            repository,
            cache,
            config,
            status: Arc::new(RwLock::new(ConnectionState::Idle)),
            worker: None,
        }
    }

    pub fn cache(&self) -> &Arc<ReleaseCache> {
        &self.cache
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.read()
    }

    /// Whether the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Spawn the sync worker.
    ///
    /// Fails with [`SyncError::AlreadyStarted`] until [`stop`](Self::stop)
    /// has been called, including after a terminal failure.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(SyncError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = bounded(0);
        let disposed = Arc::new(RwLock::new(false));
        *self.status.write() = ConnectionState::Idle;

        let session = Session {
            repository: Arc::clone(&self.repository),
            cache: Arc::clone(&self.cache),
            config: self.config.clone(),
            status: Arc::clone(&self.status),
            shutdown: shutdown_rx,
            disposed: Arc::clone(&disposed),
            fetched_since_connect: false,
            loaded_since_fetch: false,
        };

        let handle = thread::Builder::new()
            .name("release-sync".into())
            .spawn(move || session.run())?;

        self.worker = Some(Worker {
            shutdown: shutdown_tx,
            disposed,
            handle,
        });
        info!("release sync engine started");
        Ok(())
    }

    /// Unsubscribe, cancel pending timers and retries, and join the worker.
    ///
    /// A fetch already in flight finishes on its own thread and is discarded.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        *worker.disposed.write() = true;
        drop(worker.shutdown);
        if worker.handle.join().is_err() {
            error!("release sync worker panicked");
        }
        *self.status.write() = ConnectionState::Stopped;
        info!("release sync engine stopped");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen_options() -> ListenOptions {
    ListenOptions::default()
}

/// State owned by the worker thread.
struct Session {
    repository: Arc<dyn Repository>,
    cache: Arc<ReleaseCache>,
    config: SyncConfig,
    status: Arc<RwLock<ConnectionState>>,
    shutdown: Receiver<()>,
    disposed: Arc<RwLock<bool>>,
    /// Cleared on connect and reconnect; the next welcome triggers a fetch.
    fetched_since_connect: bool,
    /// Cleared on fetch; the next welcome marks the cache loaded.
    loaded_since_fetch: bool,
}

impl Session {
    fn run(mut self) {
        match self.sync() {
            Ok(()) | Err(Halt::Shutdown) => debug!("release sync worker exiting"),
            Err(Halt::Failed(error)) => {
                error!(%error, "release sync failed; restart required");
                self.set_status(ConnectionState::Failed);
                self.dispatch(CacheAction::failed(error));
            }
        }
    }

    fn sync(&mut self) -> std::result::Result<(), Halt> {
        self.dispatch(CacheAction::loading());

        loop {
            // The snapshot is fetched on the feed's welcome
            let feed = self.connect()?;
            self.consume(&feed)?;

            // Transport closed the feed; resubscribe and resync on welcome
            warn!(feed = feed.id.0, "release change feed closed; resubscribing");
            drop(feed);
            self.mark_disconnected();
        }
    }

    /// Fetch the full snapshot and replace the cache with it.
    fn resync(&mut self) -> std::result::Result<(), Halt> {
        let value = self.with_retries("fetch", |session, attempt| session.fetch_once(attempt))?;
        let releases: Option<Vec<Release>> =
            serde_json::from_value(value).map_err(SyncError::from)?;

        info!(
            releases = releases.as_ref().map_or(0, Vec::len),
            "release snapshot fetched"
        );
        self.dispatch(CacheAction::SnapshotReplaced { releases });
        self.fetched_since_connect = true;
        self.loaded_since_fetch = false;
        Ok(())
    }

    fn fetch_once(&mut self, attempt: u32) -> std::result::Result<Value, Halt> {
        self.set_status(ConnectionState::Fetching { attempt });
        debug!(attempt, "fetching releases");

        let pending = spawn_fetch(
            &self.repository,
            Query::AllReleases,
            self.config.fetch_timeout(),
        )?;
        match pending.wait(&self.shutdown) {
            FetchOutcome::Completed(result) => Ok(result?),
            FetchOutcome::Cancelled => Err(Halt::Shutdown),
        }
    }

    fn connect(&mut self) -> std::result::Result<ChangeFeed, Halt> {
        self.with_retries("listen", |session, attempt| {
            session.set_status(ConnectionState::Connecting);
            debug!(attempt, "opening release change feed");
            Ok(session
                .repository
                .listen(&Query::AllReleases, &listen_options())?)
        })
    }

    /// Run `op` until it succeeds, fails terminally, or runs out of attempts.
    fn with_retries<T>(
        &mut self,
        operation: &'static str,
        mut op: impl FnMut(&mut Self, u32) -> std::result::Result<T, Halt>,
    ) -> std::result::Result<T, Halt> {
        let max_attempts = self.config.max_attempts();
        let mut attempt = 1;

        loop {
            match op(self, attempt) {
                Ok(value) => return Ok(value),
                Err(Halt::Failed(error)) if error.is_transient() => {
                    if attempt >= max_attempts {
                        return Err(Halt::Failed(SyncError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(error),
                        }));
                    }
                    warn!(operation, attempt, %error, "transient failure; retrying");
                    self.set_status(ConnectionState::Retrying { attempt });
                    self.sleep(self.config.retry_delay())?;
                    attempt += 1;
                }
                Err(halt) => return Err(halt),
            }
        }
    }

    /// Backoff that wakes early on shutdown.
    fn sleep(&self, delay: Duration) -> std::result::Result<(), Halt> {
        match self.shutdown.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(Halt::Shutdown),
        }
    }

    /// Apply feed events until the feed closes (`Ok`) or the session halts.
    fn consume(&mut self, feed: &ChangeFeed) -> std::result::Result<(), Halt> {
        let shutdown = self.shutdown.clone();
        let events = feed.receiver().clone();

        loop {
            select! {
                recv(shutdown) -> _ => return Err(Halt::Shutdown),
                recv(events) -> msg => match msg {
                    Ok(event) => self.handle(event)?,
                    Err(_) => return Ok(()),
                },
            }
        }
    }

    fn handle(&mut self, event: FeedEvent) -> std::result::Result<(), Halt> {
        match event {
            FeedEvent::Welcome => {
                if !self.fetched_since_connect {
                    info!("change feed established; fetching releases");
                    self.resync()?;
                }
                if !self.loaded_since_fetch {
                    self.dispatch(CacheAction::loaded());
                    self.loaded_since_fetch = true;
                    self.set_status(ConnectionState::Listening);
                }
            }
            FeedEvent::Reconnect => {
                warn!("release change feed reconnecting");
                self.mark_disconnected();
            }
            FeedEvent::Mutation(mutation) => self.apply_mutation(mutation),
        }
        Ok(())
    }

    fn mark_disconnected(&mut self) {
        self.fetched_since_connect = false;
        self.loaded_since_fetch = false;
        self.set_status(ConnectionState::Connecting);
        self.dispatch(CacheAction::loading());
    }

    fn apply_mutation(&mut self, mutation: MutationEvent) {
        if !self.fetched_since_connect {
            // The resync snapshot on the next welcome supersedes it
            debug!(
                document_id = %mutation.document_id,
                "discarding mutation received while disconnected"
            );
            return;
        }

        let id = release_id_from_document_id(&mutation.document_id).to_string();
        match mutation.transition {
            Transition::Disappear => {
                debug!(release = %id, "release removed");
                self.dispatch(CacheAction::EntityRemoved { id });
            }
            Transition::Appear | Transition::Update => {
                let Some(result) = mutation.result else {
                    warn!(release = %id, "mutation without result; skipping");
                    return;
                };
                match serde_json::from_value::<Release>(result) {
                    Ok(release) => {
                        debug!(release = %release.id, revision = release.revision, "release upserted");
                        self.dispatch(CacheAction::EntityUpserted { release });
                    }
                    Err(error) => warn!(release = %id, %error, "undecodable release; skipping"),
                }
            }
        }
    }

    fn dispatch(&self, action: CacheAction) {
        let disposed = self.disposed.read();
        if *disposed {
            debug!(action = action.name(), "engine disposed; discarding");
            return;
        }
        self.cache.dispatch(action);
    }

    fn set_status(&self, state: ConnectionState) {
        if !*self.disposed.read() {
            *self.status.write() = state;
        }
    }
}
