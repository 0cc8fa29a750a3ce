//! The named indexes owned by one indexer.

use super::sorted::SortedIndex;
use crate::error::{IndexError, Result};
use crate::types::MessageId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Index of messages addressed to the local identity.
pub const INBOX: &str = "inbox";

/// Index of reactions to the local identity's messages.
pub const NOTICES: &str = "notices";

/// Total and unread row counts of one index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexCount {
    pub total: usize,
    pub unread: usize,
}

/// Counts of every index, keyed by index name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexCounts(pub BTreeMap<String, IndexCount>);

impl IndexCounts {
    pub fn get(&self, index: &str) -> Option<IndexCount> {
        self.0.get(index).copied()
    }
}

/// A fixed set of named [`SortedIndex`]es.
///
/// Created once with its names and never shrinks; every lookup by an unknown
/// name is an [`IndexError::UnknownIndex`].
pub struct IndexSet {
    indexes: BTreeMap<String, SortedIndex>,
}

impl IndexSet {
    pub fn new<I, S>(names: I, recency_window: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let indexes = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                let index = SortedIndex::with_recency_window(name.clone(), recency_window);
                (name, index)
            })
            .collect();
        Self { indexes }
    }

    pub fn get(&self, name: &str) -> Result<&SortedIndex> {
        self.indexes
            .get(name)
            .ok_or_else(|| IndexError::UnknownIndex(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut SortedIndex> {
        self.indexes
            .get_mut(name)
            .ok_or_else(|| IndexError::UnknownIndex(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.indexes.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SortedIndex> {
        self.indexes.values()
    }

    pub fn counts(&self) -> IndexCounts {
        IndexCounts(
            self.indexes
                .iter()
                .map(|(name, index)| {
                    let count = IndexCount {
                        total: index.len(),
                        unread: index.unread_count(),
                    };
                    (name.clone(), count)
                })
                .collect(),
        )
    }

    /// Set the cached read flag of `key` in every index that holds it.
    ///
    /// Returns the names of the indexes whose flag actually changed.
    pub fn set_read(&mut self, key: &MessageId, is_read: bool) -> Vec<String> {
        self.indexes
            .iter_mut()
            .filter_map(|(name, index)| match index.set_read(key, is_read) {
                Some(was) if was != is_read => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}
