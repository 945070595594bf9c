//! Release cache: a keyed collection of releases plus a load phase.
//!
//! State changes only through [`apply`], a pure function over a closed set
//! of [`CacheAction`]s. [`ReleaseCache`] wraps the state in a copy-on-write
//! container so readers always see a complete snapshot.

mod reducer;
mod store;

pub use reducer::{apply, CacheAction, CacheState, Phase};
pub use store::{ReleaseCache, ReleasesView};
