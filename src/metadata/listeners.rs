//! Reference-counted set of release ids.

use std::collections::BTreeMap;
use tracing::warn;

/// Multiset of interested release ids.
///
/// An id is tracked while its count is above zero. Removing an id more
/// times than it was added is ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerCounts {
    counts: BTreeMap<String, usize>,
}

impl ListenerCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference per id. Returns whether the tracked set changed.
    pub fn add<S: AsRef<str>>(&mut self, ids: &[S]) -> bool {
        let mut changed = false;
        for id in ids {
            let count = self.counts.entry(id.as_ref().to_string()).or_insert(0);
            if *count == 0 {
                changed = true;
            }
            *count += 1;
        }
        changed
    }

    /// Drop one reference per id. Returns whether the tracked set changed.
    pub fn remove<S: AsRef<str>>(&mut self, ids: &[S]) -> bool {
        let mut changed = false;
        for id in ids {
            let id = id.as_ref();
            match self.counts.get_mut(id) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.counts.remove(id);
                    changed = true;
                }
                None => warn!(release = id, "removing untracked listener id; ignoring"),
            }
        }
        changed
    }

    pub fn count(&self, id: &str) -> usize {
        self.counts.get(id).copied().unwrap_or(0)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.counts.contains_key(id)
    }

    /// Tracked ids, sorted.
    pub fn tracked(&self) -> Vec<String> {
        self.counts.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
