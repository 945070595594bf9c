//! # Release Sync
//!
//! Client-side synchronization core for content releases: named groupings
//! of document versions that are published together.
//!
//! ## Core Concepts
//!
//! - **Release Cache**: Copy-on-write mirror of every release, changed only
//!   through a pure reducer
//! - **Sync Engine**: Sole cache writer; bootstraps from a snapshot, applies
//!   the change feed, resyncs after reconnects
//! - **Metadata Aggregator**: Batched per-release document counts for a
//!   reference-counted set of ids
//! - **Perspective Resolver**: Exactly one current release from navigation
//!   state, plus document membership
//!
//! ## Example
//!
//! ```ignore
//! use release_sync::{InMemoryRepository, ReleaseCache, SyncConfig, SyncEngine};
//! use std::sync::Arc;
//!
//! let repository = Arc::new(InMemoryRepository::new());
//! let config = SyncConfig::default();
//! let cache = Arc::new(ReleaseCache::from_config(&config));
//!
//! let mut engine = SyncEngine::new(repository, cache.clone(), config);
//! engine.start()?;
//!
//! let view = cache.view();
//! println!("{} releases, loading={}", view.data.len(), view.loading);
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod metadata;
pub mod operations;
pub mod perspective;
pub mod repository;
pub mod subscriptions;
pub mod sync;
pub mod types;

// Re-exports
pub use cache::{apply, CacheAction, CacheState, Phase, ReleaseCache, ReleasesView};
pub use config::{load_config, AggregatorConfig, ReleasesConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use metadata::{ListenerCounts, MetadataAggregator, MetadataState};
pub use operations::{ReleaseDraft, ReleaseOperations};
pub use perspective::{
    is_in_perspective, resolve_perspective, CurrentRelease, NavigationState, Perspective,
    PerspectiveResolver, RouterState,
};
pub use repository::{
    ChangeFeed, FeedEvent, InMemoryRepository, ListenEventKind, ListenOptions, MutationEvent,
    Patch, Query, Repository, Transition,
};
pub use subscriptions::{SubscriptionHandle, SubscriptionId, SubscriptionManager};
pub use sync::{ConnectionState, SyncEngine};
pub use types::*;
