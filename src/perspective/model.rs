//! Perspective values and the pure resolution rules.

use crate::cache::CacheState;
use crate::types::{split_document_id, Release, PUBLISHED_SCOPE};
use std::fmt;

/// Navigation parameter prefix naming a release.
pub const RELEASE_PARAM_PREFIX: &str = "release.";

/// The selected release context, as written in navigation state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Perspective {
    /// No explicit release: drafts and published documents.
    #[default]
    Latest,
    Release(String),
}

impl Perspective {
    /// Parse a navigation parameter. Empty or malformed values are `Latest`.
    pub fn from_param(param: &str) -> Self {
        match param.strip_prefix(RELEASE_PARAM_PREFIX) {
            Some(id) if !id.is_empty() => Perspective::Release(id.to_string()),
            _ => Perspective::Latest,
        }
    }

    pub fn to_param(&self) -> String {
        match self {
            Perspective::Latest => String::new(),
            Perspective::Release(id) => format!("{RELEASE_PARAM_PREFIX}{id}"),
        }
    }

    pub fn release_id(&self) -> Option<&str> {
        match self {
            Perspective::Latest => None,
            Perspective::Release(id) => Some(id),
        }
    }
}

impl fmt::Display for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Perspective::Latest => f.write_str("latest"),
            Perspective::Release(id) => write!(f, "{RELEASE_PARAM_PREFIX}{id}"),
        }
    }
}

/// Exactly one current release: a cached release or the `Latest` sentinel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CurrentRelease {
    Latest,
    Release(Release),
}

impl CurrentRelease {
    pub fn is_latest(&self) -> bool {
        matches!(self, CurrentRelease::Latest)
    }

    pub fn release(&self) -> Option<&Release> {
        match self {
            CurrentRelease::Latest => None,
            CurrentRelease::Release(release) => Some(release),
        }
    }

    pub fn perspective(&self) -> Perspective {
        match self {
            CurrentRelease::Latest => Perspective::Latest,
            CurrentRelease::Release(release) => Perspective::Release(release.id.clone()),
        }
    }
}

/// Resolve a navigation parameter against a cache snapshot.
///
/// Unknown ids (stale links, deleted releases, cache still loading) fall
/// back to `Latest`.
pub fn resolve_perspective(param: &str, state: &CacheState) -> CurrentRelease {
    match Perspective::from_param(param) {
        Perspective::Latest => CurrentRelease::Latest,
        Perspective::Release(id) => match state.get(&id) {
            Some(release) => CurrentRelease::Release(release.clone()),
            None => CurrentRelease::Latest,
        },
    }
}

/// Whether a document version is visible under a perspective parameter.
///
/// With no release selected, only unscoped documents (bare, `drafts.` or
/// `published.`) are in. With a release selected, only documents scoped to
/// exactly that release are.
pub fn is_in_perspective(document_id: &str, perspective: Option<&str>) -> bool {
    let scope = split_document_id(document_id);
    match Perspective::from_param(perspective.unwrap_or_default()) {
        Perspective::Latest => scope.release_id().is_none(),
        Perspective::Release(id) => {
            scope.scope != Some(PUBLISHED_SCOPE) && scope.scope == Some(id.as_str())
        }
    }
}
