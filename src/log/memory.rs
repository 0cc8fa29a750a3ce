//! In-memory message log.

use super::{LogEvent, LogSource};
use crate::error::Result;
use crate::types::{LogEntry, Message, MessageId, Timestamp};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    /// Message ID to arrival position.
    by_key: HashMap<MessageId, usize>,
    /// Message type to arrival positions.
    by_type: HashMap<String, Vec<usize>>,
    /// Open live streams.
    live: Vec<Sender<LogEvent>>,
    closed: bool,
}

/// Append-only log held in memory.
///
/// Appends are idempotent per identity: appending a message whose identity
/// is already present returns the existing entry.
#[derive(Default)]
pub struct MemoryLog {
    inner: RwLock<LogInner>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message under its content-addressed identity.
    pub fn append(&self, message: Message) -> Result<LogEntry> {
        let key = MessageId::for_message(&message)?;
        Ok(self.append_with_key(key, message))
    }

    /// Append a message under an identity chosen by the caller.
    pub fn append_with_key(&self, key: MessageId, message: Message) -> LogEntry {
        let mut inner = self.inner.write();

        if let Some(&pos) = inner.by_key.get(&key) {
            return inner.entries[pos].clone();
        }

        let pos = inner.entries.len();
        let entry = LogEntry {
            key: key.clone(),
            seq: pos as u64,
            received: Timestamp::now(),
            value: message,
        };

        inner.entries.push(entry.clone());
        inner.by_key.insert(key, pos);
        inner
            .by_type
            .entry(entry.value.kind.clone())
            .or_default()
            .push(pos);

        let event = LogEvent::Entry(entry.clone());
        inner.live.retain(|tx| tx.send(event.clone()).is_ok());

        entry
    }

    /// Number of entries in the log.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of open live streams.
    pub fn stream_count(&self) -> usize {
        self.inner.read().live.len()
    }

    /// End every live stream. Later streams send their backlog and end.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        inner.closed = true;
        inner.live.clear();
    }
}

impl LogSource for MemoryLog {
    fn stream(&self, from: u64) -> Receiver<LogEvent> {
        let mut inner = self.inner.write();
        let (tx, rx) = unbounded();

        let start = (from as usize).min(inner.entries.len());
        for entry in &inner.entries[start..] {
            let _ = tx.send(LogEvent::Entry(entry.clone()));
        }
        let _ = tx.send(LogEvent::Synced);

        if !inner.closed {
            inner.live.push(tx);
        }
        rx
    }

    fn get(&self, key: &MessageId) -> Result<Option<Message>> {
        let inner = self.inner.read();
        Ok(inner
            .by_key
            .get(key)
            .map(|&pos| inner.entries[pos].value.clone()))
    }

    fn messages_by_type(&self, kind: &str) -> Result<Vec<LogEntry>> {
        let inner = self.inner.read();
        Ok(inner
            .by_type
            .get(kind)
            .map(|positions| {
                positions
                    .iter()
                    .map(|&pos| inner.entries[pos].clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}
