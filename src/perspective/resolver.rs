//! Navigation state and the resolver that reads it.

use crate::cache::ReleaseCache;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use super::model::{is_in_perspective, resolve_perspective, CurrentRelease, Perspective};

/// Ambient navigation state holding the perspective parameter.
pub trait NavigationState: Send + Sync {
    /// Current parameter: `""` or `"release.<id>"`.
    fn perspective_param(&self) -> String;

    fn set_perspective_param(&self, param: &str);
}

/// In-memory navigation state.
#[derive(Debug, Default)]
pub struct RouterState {
    perspective: RwLock<String>,
}

impl RouterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_param(param: impl Into<String>) -> Self {
        Self {
            perspective: RwLock::new(param.into()),
        }
    }
}

impl NavigationState for RouterState {
    fn perspective_param(&self) -> String {
        self.perspective.read().clone()
    }

    fn set_perspective_param(&self, param: &str) {
        *self.perspective.write() = param.to_string();
    }
}

/// Resolves the current release from navigation state and the cache.
///
/// Holds no state of its own; every read recomputes from the latest
/// navigation parameter and cache snapshot.
pub struct PerspectiveResolver {
    cache: Arc<ReleaseCache>,
    navigation: Arc<dyn NavigationState>,
}

impl PerspectiveResolver {
    pub fn new(cache: Arc<ReleaseCache>, navigation: Arc<dyn NavigationState>) -> Self {
        Self { cache, navigation }
    }

    /// The perspective as written, before checking the cache.
    pub fn current_perspective(&self) -> Perspective {
        Perspective::from_param(&self.navigation.perspective_param())
    }

    pub fn current_release(&self) -> CurrentRelease {
        resolve_perspective(&self.navigation.perspective_param(), &self.cache.snapshot())
    }

    /// Navigation write only; the cache is untouched.
    pub fn set_perspective(&self, perspective: Perspective) {
        debug!(%perspective, "perspective changed");
        self.navigation.set_perspective_param(&perspective.to_param());
    }

    /// Whether a document version belongs to the resolved current release.
    pub fn contains_document(&self, document_id: &str) -> bool {
        let param = self.current_release().perspective().to_param();
        is_in_perspective(document_id, Some(&param))
    }
}
