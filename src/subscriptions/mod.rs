//! Bounded in-process broadcast.
//!
//! Backs every reactive output of the crate (cache snapshots, metadata
//! snapshots) and the change feeds of the in-memory repository.
//!
//! Subscriptions support:
//! - Routing by a per-subscription key
//! - Bounded buffers with slow-subscriber dropping
//!
//! # Example
//!
//! ```ignore
//! let manager: SubscriptionManager<Arc<CacheState>> = SubscriptionManager::new(64);
//! let handle = manager.subscribe(());
//!
//! manager.publish(cache.snapshot());
//! let state = handle.recv()?;
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{SubscriptionHandle, SubscriptionId};
