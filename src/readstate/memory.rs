//! In-memory read-state store.

use super::{ReadStateOp, ReadStateStore};
use crate::error::Result;
use crate::types::MessageId;
use parking_lot::RwLock;
use std::collections::HashSet;

/// Read-state store that lives only as long as the process.
#[derive(Default)]
pub struct MemoryReadState {
    read: RwLock<HashSet<MessageId>>,
}

impl MemoryReadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys marked read.
    pub fn len(&self) -> usize {
        self.read.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read.read().is_empty()
    }
}

impl ReadStateStore for MemoryReadState {
    fn get(&self, key: &MessageId) -> Result<bool> {
        Ok(self.read.read().contains(key))
    }

    fn put(&self, key: &MessageId) -> Result<()> {
        self.read.write().insert(key.clone());
        Ok(())
    }

    fn delete(&self, key: &MessageId) -> Result<()> {
        self.read.write().remove(key);
        Ok(())
    }

    fn batch(&self, ops: &[ReadStateOp]) -> Result<()> {
        let mut read = self.read.write();
        for op in ops {
            match op {
                ReadStateOp::Put(key) => {
                    read.insert(key.clone());
                }
                ReadStateOp::Delete(key) => {
                    read.remove(key);
                }
            }
        }
        Ok(())
    }
}
