//! Core types for releases and their derived metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Document id prefix under which release entities live in the repository.
pub const RELEASE_DOCUMENT_PREFIX: &str = "_.releases.";

/// Reserved scope for draft documents (the unscoped, editable identity).
pub const DRAFTS_SCOPE: &str = "drafts";

/// Reserved scope for published documents. Never a release.
pub const PUBLISHED_SCOPE: &str = "published";

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Repository document id for a release id.
pub fn release_document_id(release_id: &str) -> String {
    format!("{RELEASE_DOCUMENT_PREFIX}{release_id}")
}

/// Release id for a repository document id.
///
/// Ids without the release prefix are returned unchanged.
pub fn release_id_from_document_id(document_id: &str) -> &str {
    document_id
        .strip_prefix(RELEASE_DOCUMENT_PREFIX)
        .unwrap_or(document_id)
}

/// Repository id of the version of `base_id` held in a release.
pub fn version_document_id(release_id: &str, base_id: &str) -> String {
    format!("{release_id}.{base_id}")
}

/// Whether a repository document id names a release entity.
pub fn is_release_document_id(document_id: &str) -> bool {
    document_id.starts_with(RELEASE_DOCUMENT_PREFIX)
}

/// A release: a named grouping of document versions published together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Release id (stored as `_.releases.<id>` in the repository).
    #[serde(rename = "_id", with = "document_id_serde")]
    pub id: String,

    /// Revision assigned by the repository, increasing on every write.
    #[serde(rename = "_rev", default)]
    pub revision: u64,

    #[serde(rename = "_createdAt", default)]
    pub created_at: Timestamp,

    #[serde(default)]
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Presentational hint, opaque here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Presentational hint, opaque here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<Timestamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<Timestamp>,

    /// Intended publish time, if scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_at: Option<Timestamp>,

    #[serde(default)]
    pub author_id: String,
}

impl Release {
    /// Create an open release with the given id and title.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: 0,
            created_at: Timestamp::now(),
            title: title.into(),
            description: None,
            icon: None,
            color: None,
            published_at: None,
            archived_at: None,
            publish_at: None,
            author_id: String::new(),
        }
    }

    /// Lifecycle state derived from the timestamps.
    pub fn state(&self) -> ReleaseState {
        if self.archived_at.is_some() {
            ReleaseState::Archived
        } else if self.published_at.is_some() {
            ReleaseState::Published
        } else if self.publish_at.is_some() {
            ReleaseState::Scheduled
        } else {
            ReleaseState::Active
        }
    }

    /// Open means neither archived nor published.
    pub fn is_open(&self) -> bool {
        matches!(self.state(), ReleaseState::Active | ReleaseState::Scheduled)
    }
}

/// Derived lifecycle state of a release.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseState {
    Active,
    Scheduled,
    Published,
    Archived,
}

/// Per-release aggregate statistics. Derived, never authoritative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseMetadata {
    pub document_count: u64,
    pub last_edited_at: Option<Timestamp>,
}

/// A document id split into its optional scope prefix and base id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DocumentScope<'a> {
    pub scope: Option<&'a str>,
    pub base_id: &'a str,
}

impl<'a> DocumentScope<'a> {
    /// The release this document version belongs to, if any.
    ///
    /// Bare ids and the reserved drafts/published scopes belong to no release.
    pub fn release_id(&self) -> Option<&'a str> {
        match self.scope {
            Some(DRAFTS_SCOPE) | Some(PUBLISHED_SCOPE) | None => None,
            Some(scope) => Some(scope),
        }
    }
}

/// Split `<scope>.<baseId>` at the first dot.
pub fn split_document_id(document_id: &str) -> DocumentScope<'_> {
    match document_id.split_once('.') {
        Some((scope, base_id)) if !scope.is_empty() && !base_id.is_empty() => DocumentScope {
            scope: Some(scope),
            base_id,
        },
        _ => DocumentScope {
            scope: None,
            base_id: document_id,
        },
    }
}

mod document_id_serde {
    use super::{release_document_id, release_id_from_document_id};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&release_document_id(id))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(release_id_from_document_id(&raw).to_string())
    }
}
