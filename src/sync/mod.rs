//! Keeps the release cache in step with the repository.

mod engine;

pub use engine::{ConnectionState, SyncEngine};
