//! Durable read/unread markers.
//!
//! A message is read when its identity is present in the store. The
//! indexes cache this fact in each row's `is_read` flag; every mutation
//! path writes the store first and the cache second.

mod journal;
mod memory;

pub use journal::{JournalConfig, JournalReadState};
pub use memory::MemoryReadState;

use crate::error::Result;
use crate::types::MessageId;
use serde::{Deserialize, Serialize};

/// One write against the read-state store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadStateOp {
    /// Mark read.
    Put(MessageId),
    /// Mark unread.
    Delete(MessageId),
}

impl ReadStateOp {
    pub fn key(&self) -> &MessageId {
        match self {
            ReadStateOp::Put(key) | ReadStateOp::Delete(key) => key,
        }
    }
}

/// Key → presence store recording which messages are read.
pub trait ReadStateStore: Send + Sync {
    /// Whether `key` is marked read.
    fn get(&self, key: &MessageId) -> Result<bool>;

    /// Mark `key` read.
    fn put(&self, key: &MessageId) -> Result<()>;

    /// Mark `key` unread.
    fn delete(&self, key: &MessageId) -> Result<()>;

    /// Apply several writes atomically.
    fn batch(&self, ops: &[ReadStateOp]) -> Result<()>;

    /// Look up several keys, answering in order.
    fn get_many(&self, keys: &[MessageId]) -> Result<Vec<bool>> {
        keys.iter().map(|key| self.get(key)).collect()
    }
}
