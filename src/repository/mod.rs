//! The remote document repository contract.
//!
//! The repository itself is an external collaborator: it executes queries,
//! pushes change notifications, and accepts writes. This module defines
//! the contract the core consumes, a timed fetch helper, and an in-memory
//! implementation for tests and demos.

mod fetch;
mod memory;
mod types;

pub use fetch::{spawn_fetch, FetchOutcome, PendingFetch};
pub use memory::InMemoryRepository;
pub use types::{
    ChangeFeed, FeedEvent, ListenEventKind, ListenOptions, MutationEvent, Patch, Query,
    Repository, Transition,
};
