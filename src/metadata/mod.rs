//! Per-release aggregate statistics for a reference-counted set of ids.

mod aggregator;
mod listeners;

pub use aggregator::{MetadataAggregator, MetadataState};
pub use listeners::ListenerCounts;
