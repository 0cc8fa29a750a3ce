//! The append-only message log the indexes are built from.
//!
//! Storage and replication of the log belong to the embedding application;
//! the indexer only needs the [`LogSource`] view of it. [`MemoryLog`] is a
//! complete in-process implementation.

mod memory;

pub use memory::MemoryLog;

use crate::error::Result;
use crate::types::{LogEntry, Message, MessageId};
use crossbeam_channel::Receiver;

/// An item of a live log stream.
#[derive(Clone, Debug, PartialEq)]
pub enum LogEvent {
    /// The next entry in arrival order.
    Entry(LogEntry),
    /// Every entry that existed when the stream was opened has been sent.
    /// Delivered exactly once per stream.
    Synced,
}

/// Read access to the message log.
pub trait LogSource: Send + Sync {
    /// Open a live stream of entries starting at arrival position `from`.
    ///
    /// The stream sends the backlog, then [`LogEvent::Synced`], then every
    /// entry appended afterwards. It ends when the log shuts down.
    fn stream(&self, from: u64) -> Receiver<LogEvent>;

    /// Look up a message by identity. `Ok(None)` means the message is not
    /// (yet) available locally.
    fn get(&self, key: &MessageId) -> Result<Option<Message>>;

    /// Every entry of the given message type, in arrival order.
    fn messages_by_type(&self, kind: &str) -> Result<Vec<LogEntry>>;
}
