//! Types shared by repository implementations and their consumers.

use crate::error::Result;
use crate::subscriptions::SubscriptionId;
use crate::types::{is_release_document_id, split_document_id};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// The closed set of queries the core issues.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Query {
    /// Every release entity.
    AllReleases,

    /// Per-release `documentCount` and `lastEditedAt`, one entry per id.
    ReleaseMetadata { release_ids: Vec<String> },

    /// Every document version scoped to one of the releases.
    ReleaseDocuments { release_ids: Vec<String> },
}

impl Query {
    /// Aggregate query over a set of releases. Ids are sorted and deduplicated.
    pub fn release_metadata<I, S>(release_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Query::ReleaseMetadata {
            release_ids: normalize_ids(release_ids),
        }
    }

    /// Document query over a set of releases. Ids are sorted and deduplicated.
    pub fn release_documents<I, S>(release_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Query::ReleaseDocuments {
            release_ids: normalize_ids(release_ids),
        }
    }

    /// Whether a document with this id falls within the query.
    pub fn matches_document(&self, document_id: &str) -> bool {
        match self {
            Query::AllReleases => is_release_document_id(document_id),
            Query::ReleaseMetadata { release_ids } | Query::ReleaseDocuments { release_ids } => {
                if is_release_document_id(document_id) {
                    return false;
                }
                split_document_id(document_id)
                    .release_id()
                    .is_some_and(|id| release_ids.iter().any(|r| r == id))
            }
        }
    }
}

fn normalize_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    ids.into_iter()
        .map(Into::into)
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

/// How a document moved relative to a listened query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Appear,
    Update,
    Disappear,
}

/// A single document mutation pushed over a change feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    pub document_id: String,
    pub transition: Transition,
    /// Post-mutation document, when the listener asked for results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Events emitted by a change feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    /// Subscription established (or re-established).
    Welcome,
    /// Transport is re-establishing; events may have been missed.
    Reconnect,
    /// A document matching the query changed.
    Mutation(MutationEvent),
}

impl FeedEvent {
    pub fn kind(&self) -> ListenEventKind {
        match self {
            FeedEvent::Welcome => ListenEventKind::Welcome,
            FeedEvent::Reconnect => ListenEventKind::Reconnect,
            FeedEvent::Mutation(_) => ListenEventKind::Mutation,
        }
    }
}

/// Event kinds a listener can opt into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenEventKind {
    Welcome,
    Mutation,
    Reconnect,
}

/// Options for opening a change feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenOptions {
    /// Embed the post-mutation document in mutation events.
    pub include_result: bool,
    pub events: Vec<ListenEventKind>,
}

impl ListenOptions {
    pub fn wants(&self, kind: ListenEventKind) -> bool {
        self.events.contains(&kind)
    }
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            include_result: true,
            events: vec![
                ListenEventKind::Welcome,
                ListenEventKind::Mutation,
                ListenEventKind::Reconnect,
            ],
        }
    }
}

/// A set/unset patch applied to a single document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub set: Map<String, Value>,
    #[serde(default)]
    pub unset: Vec<String>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    /// Remove a field.
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.unset.push(field.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

/// A live change-feed subscription.
///
/// Dropping the feed unsubscribes it from the repository.
pub struct ChangeFeed {
    pub id: SubscriptionId,
    receiver: Receiver<FeedEvent>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl ChangeFeed {
    /// Wrap a receiver. `on_close` runs exactly once, when the feed is dropped.
    pub fn new(
        id: SubscriptionId,
        receiver: Receiver<FeedEvent>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            id,
            receiver,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Underlying channel, for use in `select!`.
    pub fn receiver(&self) -> &Receiver<FeedEvent> {
        &self.receiver
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<FeedEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeed").field("id", &self.id).finish()
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        if let Some(close) = self.on_close.take() {
            close();
        }
    }
}

/// The remote document repository, as consumed by this crate.
///
/// Implementations own transport, storage and query evaluation. `fetch` and
/// the write calls may block; callers that need a bound wrap `fetch` with
/// [`spawn_fetch`](super::spawn_fetch). `listen` runs on the sync and
/// metadata worker threads and must return promptly.
pub trait Repository: Send + Sync {
    /// Point-in-time query execution.
    fn fetch(&self, query: &Query) -> Result<Value>;

    /// Open a change feed for documents matching `query`.
    ///
    /// Must not wait for the connection to be established: return the feed
    /// at once and deliver [`FeedEvent::Welcome`] through it when ready.
    /// Connection failures after this call surface as a closed feed.
    fn listen(&self, query: &Query, options: &ListenOptions) -> Result<ChangeFeed>;

    /// Create a document. Returns the stored document.
    fn create(&self, id: &str, payload: Value) -> Result<Value>;

    /// Patch an existing document. Returns the stored document.
    fn patch(&self, id: &str, patch: Patch) -> Result<Value>;

    /// Delete a document.
    fn delete(&self, id: &str) -> Result<()>;
}
