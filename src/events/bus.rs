//! Gated fan-out of index events to subscribers.

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::types::{BusConfig, DropReason, EventSubscription, IndexEvent, SubscriptionId};

struct Subscriber {
    sender: Sender<IndexEvent>,
}

impl Subscriber {
    /// Deliver without blocking. False means the subscriber has to go.
    fn deliver(&self, event: IndexEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn notify_dropped(&self, reason: DropReason) {
        let _ = self.sender.try_send(IndexEvent::Dropped { reason });
    }
}

/// Publish/subscribe channel for index events.
///
/// Nothing is delivered until [`mark_history_synced`](Self::mark_history_synced)
/// has been called, so replaying the historical backlog on start never
/// reaches subscribers. Events are not buffered for late subscribers.
pub struct NotificationBus {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    /// One-way: set once the initial backlog is indexed.
    history_synced: AtomicBool,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            history_synced: AtomicBool::new(false),
        }
    }

    /// Attach a subscriber. It sees only events published from now on.
    pub fn subscribe(&self, config: BusConfig) -> EventSubscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));
        self.subscribers.write().insert(id, Subscriber { sender });
        EventSubscription { id, receiver }
    }

    /// Detach a subscriber. Its channel gets a final `Dropped` event if
    /// there is room for one.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscribers.write().remove(&id) {
            sub.notify_dropped(DropReason::Unsubscribed);
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Open the gate. Irreversible.
    pub fn mark_history_synced(&self) {
        self.history_synced.store(true, Ordering::SeqCst);
    }

    pub fn is_history_synced(&self) -> bool {
        self.history_synced.load(Ordering::SeqCst)
    }

    /// Deliver an event to every subscriber. Returns false if the gate is
    /// still closed and the event was discarded.
    ///
    /// Subscribers whose buffer is full are dropped.
    pub fn publish(&self, event: IndexEvent) -> bool {
        if !self.is_history_synced() {
            return false;
        }

        let lagging: Vec<SubscriptionId> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, sub)| !sub.deliver(event.clone()))
            .map(|(id, _)| *id)
            .collect();

        if !lagging.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in lagging {
                if let Some(sub) = subscribers.remove(&id) {
                    tracing::warn!(subscription = id.0, "dropping slow event subscriber");
                    sub.notify_dropped(DropReason::BufferOverflow);
                }
            }
        }

        true
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
