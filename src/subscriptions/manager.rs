//! Subscription manager for broadcasting events to bounded subscribers.

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{SubscriptionHandle, SubscriptionId};

/// Internal subscription state.
struct Subscription<T, K> {
    /// Caller-supplied routing key, matched by broadcast filters.
    key: K,
    sender: Sender<T>,
}

impl<T, K> Subscription<T, K> {
    /// Try to send an event. Returns false if the subscriber is full or gone.
    fn try_send(&self, event: T) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Manages subscriptions and broadcasts events.
///
/// Each subscription carries a key of type `K` that broadcast filters match
/// against. Subscribers that fall behind (full buffer) or hang up are
/// dropped rather than blocking the broadcaster.
pub struct SubscriptionManager<T, K = ()> {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription<T, K>>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Per-subscriber channel capacity.
    buffer_size: usize,
}

impl<T: Clone, K> SubscriptionManager<T, K> {
    /// Create a new subscription manager.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Create a new subscription routed by `key`.
    pub fn subscribe(&self, key: K) -> SubscriptionHandle<T> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.buffer_size);

        self.subscriptions
            .write()
            .insert(id, Subscription { key, sender });

        SubscriptionHandle { id, receiver }
    }

    /// Unsubscribe and clean up. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.write().remove(&id).is_some()
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Send an event to every subscription whose key passes `filter`.
    ///
    /// Returns the number of subscribers that accepted the event.
    pub fn broadcast<F>(&self, filter: F, event: T) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let mut to_remove = Vec::new();
        let mut delivered = 0;

        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                if !filter(&sub.key) {
                    continue;
                }
                if sub.try_send(event.clone()) {
                    delivered += 1;
                } else {
                    to_remove.push(*id);
                }
            }
        }

        // Remove dropped subscriptions
        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if subs.remove(&id).is_some() {
                    tracing::debug!(subscription = id.0, "dropped slow or closed subscriber");
                }
            }
        }

        delivered
    }

    /// Send an event directly to one subscription.
    /// Returns false if the subscription was dropped.
    pub fn send_to(&self, id: SubscriptionId, event: T) -> bool {
        let delivered = {
            let subs = self.subscriptions.read();
            match subs.get(&id) {
                Some(sub) => sub.try_send(event),
                None => return false,
            }
        };

        if !delivered {
            self.subscriptions.write().remove(&id);
        }
        delivered
    }

    /// Drop every subscription. Receivers observe a disconnected channel.
    pub fn clear(&self) -> usize {
        let mut subs = self.subscriptions.write();
        let count = subs.len();
        subs.clear();
        count
    }
}

impl<T: Clone> SubscriptionManager<T, ()> {
    /// Broadcast to every subscriber.
    pub fn publish(&self, event: T) -> usize {
        self.broadcast(|_| true, event)
    }
}
