//! Copy-on-write container for the release cache.

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::subscriptions::{SubscriptionHandle, SubscriptionManager};
use crate::types::Release;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use super::reducer::{apply, CacheAction, CacheState};

/// Default buffer for cache subscribers.
const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// The `{data, loading, error}` triple handed to UI collaborators.
#[derive(Clone, Debug)]
pub struct ReleasesView {
    pub data: Vec<Release>,
    pub loading: bool,
    pub error: Option<Arc<SyncError>>,
}

/// Shared release cache.
///
/// Readers take an `Arc` snapshot and never observe a half-applied action.
/// Writes go through [`dispatch`](Self::dispatch), which only the sync
/// engine calls.
pub struct ReleaseCache {
    state: RwLock<Arc<CacheState>>,
    /// Serializes dispatches so a broadcast never overtakes a later state.
    write_lock: Mutex<()>,
    watchers: SubscriptionManager<Arc<CacheState>>,
}

impl ReleaseCache {
    pub fn new() -> Self {
        Self::with_subscriber_buffer(DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Cache sized by `config.subscriber_buffer`.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::with_subscriber_buffer(config.subscriber_buffer)
    }

    pub fn with_subscriber_buffer(buffer_size: usize) -> Self {
        Self {
            state: RwLock::new(Arc::new(CacheState::new())),
            write_lock: Mutex::new(()),
            watchers: SubscriptionManager::new(buffer_size),
        }
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<CacheState> {
        Arc::clone(&self.state.read())
    }

    /// Current releases plus load state.
    pub fn view(&self) -> ReleasesView {
        let state = self.snapshot();
        ReleasesView {
            data: state.releases().into_iter().cloned().collect(),
            loading: state.is_loading(),
            error: state.error.clone(),
        }
    }

    /// Receive every new snapshot after this call.
    pub fn subscribe(&self) -> SubscriptionHandle<Arc<CacheState>> {
        self.watchers.subscribe(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.watchers.subscription_count()
    }

    /// Apply an action and publish the resulting snapshot.
    pub(crate) fn dispatch(&self, action: CacheAction) -> Arc<CacheState> {
        let _lock = self.write_lock.lock();

        let name = action.name();
        let current = self.snapshot();
        let next = Arc::new(apply(CacheState::clone(&current), action));
        *self.state.write() = Arc::clone(&next);

        tracing::trace!(action = name, releases = next.len(), phase = ?next.phase, "cache updated");
        self.watchers.publish(Arc::clone(&next));
        next
    }
}

impl Default for ReleaseCache {
    fn default() -> Self {
        Self::new()
    }
}
