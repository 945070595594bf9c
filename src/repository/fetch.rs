//! Bounded, cancellable fetches on a helper thread.

use crate::error::{Result, SyncError};
use crossbeam_channel::{at, bounded, select, Receiver};
use serde_json::Value;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::types::{Query, Repository};

/// How a pending fetch ended, from the waiter's point of view.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The fetch finished, failed, or hit its deadline.
    Completed(Result<Value>),
    /// The waiter was cancelled; any late result is discarded.
    Cancelled,
}

/// A fetch running on its own thread.
///
/// The helper thread always runs to completion. If the waiter gives up
/// first, the result lands in a channel nobody reads.
pub struct PendingFetch {
    receiver: Receiver<Result<Value>>,
    deadline: Instant,
    timeout: Duration,
}

/// Start `repository.fetch(query)` with a deadline of `timeout` from now.
pub fn spawn_fetch(
    repository: &Arc<dyn Repository>,
    query: Query,
    timeout: Duration,
) -> Result<PendingFetch> {
    let (sender, receiver) = bounded(1);
    let repository = Arc::clone(repository);

    thread::Builder::new()
        .name("release-fetch".into())
        .spawn(move || {
            let result = repository.fetch(&query);
            // Receiver may be gone if the waiter timed out or was cancelled
            let _ = sender.send(result);
        })?;

    Ok(PendingFetch {
        receiver,
        deadline: Instant::now() + timeout,
        timeout,
    })
}

impl PendingFetch {
    /// Wait for the result, the deadline, or any message (or hang-up) on `cancel`.
    pub fn wait<C>(self, cancel: &Receiver<C>) -> FetchOutcome {
        select! {
            recv(self.receiver) -> msg => FetchOutcome::Completed(flatten(msg.ok())),
            recv(cancel) -> _ => FetchOutcome::Cancelled,
            recv(at(self.deadline)) -> _ => FetchOutcome::Completed(Err(SyncError::Timeout(self.timeout))),
        }
    }
}

fn flatten(msg: Option<Result<Value>>) -> Result<Value> {
    msg.unwrap_or_else(|| Err(SyncError::Transport("fetch worker exited".into())))
}
