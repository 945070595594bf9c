//! Release lifecycle and version writes.
//!
//! Operations go straight to the repository. The cache is never touched
//! here; the resulting mutations arrive through the sync engine's feed.

use crate::error::{Result, SyncError};
use crate::repository::{Patch, Repository};
use crate::types::{
    release_document_id, version_document_id, Release, Timestamp, DRAFTS_SCOPE, PUBLISHED_SCOPE,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// User-editable release metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDraft {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl ReleaseDraft {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Patch that sets present fields and unsets cleared ones.
    fn to_patch(&self) -> Patch {
        let optional = [
            ("description", &self.description),
            ("icon", &self.icon),
            ("color", &self.color),
        ];

        optional.into_iter().fold(
            Patch::new().set("title", self.title.as_str()),
            |patch, (field, value)| match value {
                Some(value) => patch.set(field, value.as_str()),
                None => patch.unset(field),
            },
        )
    }
}

/// Lifecycle writes for release entities and the document versions they hold.
pub struct ReleaseOperations {
    repository: Arc<dyn Repository>,
    author_id: Option<String>,
}

impl ReleaseOperations {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            author_id: None,
        }
    }

    /// Stamp created releases with this author.
    pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = Some(author_id.into());
        self
    }

    pub fn create_release(&self, id: &str, draft: ReleaseDraft) -> Result<Release> {
        validate_release_id(id)?;

        let mut payload = serde_json::to_value(&draft)?;
        if let (Some(author), Value::Object(map)) = (&self.author_id, &mut payload) {
            map.insert("authorId".into(), json!(author));
        }

        let stored = self.repository.create(&release_document_id(id), payload)?;
        info!(release = id, "release created");
        decode(stored)
    }

    pub fn update_release(&self, id: &str, draft: ReleaseDraft) -> Result<Release> {
        self.patch(id, draft.to_patch())
    }

    /// Set the intended publish time.
    pub fn schedule(&self, id: &str, at: Timestamp) -> Result<Release> {
        self.patch(id, Patch::new().set("publishAt", json!(at)))
    }

    pub fn unschedule(&self, id: &str) -> Result<Release> {
        self.patch(id, Patch::new().unset("publishAt"))
    }

    pub fn publish(&self, id: &str) -> Result<Release> {
        self.patch(id, Patch::new().set("publishedAt", json!(Timestamp::now())))
    }

    pub fn archive(&self, id: &str) -> Result<Release> {
        self.patch(id, Patch::new().set("archivedAt", json!(Timestamp::now())))
    }

    pub fn unarchive(&self, id: &str) -> Result<Release> {
        self.patch(id, Patch::new().unset("archivedAt"))
    }

    pub fn delete_release(&self, id: &str) -> Result<()> {
        validate_release_id(id)?;
        self.repository.delete(&release_document_id(id))?;
        info!(release = id, "release deleted");
        Ok(())
    }

    /// Add a version of document `doc_id` to a release.
    ///
    /// Returns the stored version. Its mutation reaches the metadata
    /// aggregator's feed like any other write.
    pub fn create_version(&self, release_id: &str, doc_id: &str, payload: Value) -> Result<Value> {
        validate_release_id(release_id)?;
        validate_document_id(doc_id)?;

        let id = version_document_id(release_id, doc_id);
        let stored = self.repository.create(&id, payload)?;
        debug!(release = release_id, document = doc_id, "version created");
        Ok(stored)
    }

    /// Remove the version of `doc_id` from a release.
    pub fn discard_version(&self, release_id: &str, doc_id: &str) -> Result<()> {
        validate_release_id(release_id)?;
        validate_document_id(doc_id)?;

        self.repository.delete(&version_document_id(release_id, doc_id))?;
        debug!(release = release_id, document = doc_id, "version discarded");
        Ok(())
    }

    fn patch(&self, id: &str, patch: Patch) -> Result<Release> {
        validate_release_id(id)?;
        let stored = self.repository.patch(&release_document_id(id), patch)?;
        info!(release = id, "release updated");
        decode(stored)
    }
}

/// Release ids become document scopes, so they cannot contain dots or
/// shadow the reserved scopes.
fn validate_release_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('.') || id == DRAFTS_SCOPE || id == PUBLISHED_SCOPE {
        return Err(SyncError::InvalidDocument(format!(
            "invalid release id {id:?}"
        )));
    }
    Ok(())
}

fn validate_document_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(SyncError::InvalidDocument("empty document id".into()));
    }
    Ok(())
}

fn decode(stored: Value) -> Result<Release> {
    Ok(serde_json::from_value(stored)?)
}
