//! Cache state and the pure transition function.

use crate::error::SyncError;
use crate::types::Release;
use std::collections::HashMap;
use std::sync::Arc;

/// Load phase of the release cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Initializing,
    Loading,
    Loaded,
    Error,
}

/// Immutable snapshot of the release cache.
#[derive(Clone, Debug, Default)]
pub struct CacheState {
    /// Releases by id. At most one entity per id.
    pub entities: HashMap<String, Release>,
    pub phase: Phase,
    /// Terminal sync error, present only in [`Phase::Error`].
    pub error: Option<Arc<SyncError>>,
}

impl CacheState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Release> {
        self.entities.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// True until the first snapshot has been confirmed live.
    pub fn is_loading(&self) -> bool {
        matches!(self.phase, Phase::Initializing | Phase::Loading)
    }

    /// All releases, oldest first (ties broken by id).
    pub fn releases(&self) -> Vec<&Release> {
        let mut releases: Vec<&Release> = self.entities.values().collect();
        releases.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        releases
    }

    /// Releases that are neither archived nor published.
    pub fn active_releases(&self) -> Vec<&Release> {
        self.releases().into_iter().filter(|r| r.is_open()).collect()
    }

    pub fn archived_releases(&self) -> Vec<&Release> {
        self.releases()
            .into_iter()
            .filter(|r| r.archived_at.is_some())
            .collect()
    }
}

impl PartialEq for CacheState {
    fn eq(&self, other: &Self) -> bool {
        self.entities == other.entities
            && self.phase == other.phase
            && self.error.as_ref().map(|e| e.to_string()) == other.error.as_ref().map(|e| e.to_string())
    }
}

/// The closed set of cache transitions.
#[derive(Clone, Debug)]
pub enum CacheAction {
    /// Move between loading/loaded, or into error when `error` is set.
    LoadingStateChanged {
        loading: bool,
        error: Option<Arc<SyncError>>,
    },

    /// Replace all entities from a fetch result. `None` empties the cache.
    SnapshotReplaced { releases: Option<Vec<Release>> },

    /// Insert or overwrite one release by id.
    EntityUpserted { release: Release },

    /// Remove one release by id.
    EntityRemoved { id: String },
}

impl CacheAction {
    pub fn loading() -> Self {
        CacheAction::LoadingStateChanged {
            loading: true,
            error: None,
        }
    }

    pub fn loaded() -> Self {
        CacheAction::LoadingStateChanged {
            loading: false,
            error: None,
        }
    }

    pub fn failed(error: SyncError) -> Self {
        CacheAction::LoadingStateChanged {
            loading: false,
            error: Some(Arc::new(error)),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            CacheAction::LoadingStateChanged { .. } => "loading_state_changed",
            CacheAction::SnapshotReplaced { .. } => "snapshot_replaced",
            CacheAction::EntityUpserted { .. } => "entity_upserted",
            CacheAction::EntityRemoved { .. } => "entity_removed",
        }
    }
}

/// Apply an action to a state.
///
/// Total and side-effect free: every action is defined for every state.
pub fn apply(mut state: CacheState, action: CacheAction) -> CacheState {
    match action {
        CacheAction::LoadingStateChanged { loading, error } => {
            state.phase = match (&error, loading) {
                (Some(_), _) => Phase::Error,
                (None, true) => Phase::Loading,
                (None, false) => Phase::Loaded,
            };
            state.error = error;
            state
        }

        CacheAction::SnapshotReplaced { releases } => {
            state.entities = releases
                .unwrap_or_default()
                .into_iter()
                .map(|release| (release.id.clone(), release))
                .collect();
            state
        }

        CacheAction::EntityUpserted { release } => {
            state.entities.insert(release.id.clone(), release);
            state
        }

        CacheAction::EntityRemoved { id } => {
            state.entities.remove(&id);
            state
        }
    }
}
