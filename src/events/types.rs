//! Event and subscription types for the notification bus.

use crate::index::IndexCounts;
use crate::types::MessageId;
use serde::{Deserialize, Serialize};

/// Per-subscriber settings.
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Events held for a subscriber before it counts as lagging and is
    /// dropped. Default: 1000
    pub buffer_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

/// Events delivered to bus subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IndexEvent {
    /// An index gained rows or a row's read flag flipped.
    ///
    /// Counts are computed once pending index work settles, so several
    /// mutations may be folded into one observation.
    IndexChange {
        index: String,
        total: usize,
        unread: usize,
        counts: IndexCounts,
    },

    /// A message was marked read or unread.
    #[serde(rename = "isread")]
    IsRead { key: MessageId, value: bool },

    /// An application event forwarded from the classifier (e.g. a new notice).
    Domain {
        kind: String,
        data: serde_json::Value,
    },

    /// Last event of a subscription that the bus let go.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The subscriber fell `buffer_size` events behind.
    BufferOverflow,
    Unsubscribed,
}

/// Handle used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receiving end of a bus subscription.
pub struct EventSubscription {
    pub id: SubscriptionId,
    pub receiver: crossbeam_channel::Receiver<IndexEvent>,
}

impl EventSubscription {
    /// Block for the next event.
    pub fn recv(&self) -> Result<IndexEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Next event if one is buffered.
    pub fn try_recv(&self) -> Result<IndexEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<IndexEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
