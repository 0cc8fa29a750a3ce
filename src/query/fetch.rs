//! Row enrichment.

use crate::error::{IndexError, Result};
use crate::log::LogSource;
use crate::types::MessageId;
use serde_json::Value;
use std::sync::Arc;

/// Looks up the value delivered alongside a row.
///
/// Called from query worker threads, several at a time. `Ok(None)` and
/// errors both surface to the consumer as a row without a value.
pub trait RowFetcher: Send + Sync {
    fn fetch(&self, key: &MessageId) -> Result<Option<Value>>;
}

impl<F> RowFetcher for F
where
    F: Fn(&MessageId) -> Result<Option<Value>> + Send + Sync,
{
    fn fetch(&self, key: &MessageId) -> Result<Option<Value>> {
        self(key)
    }
}

/// Fetches the message itself from the log.
pub struct MessageFetcher {
    log: Arc<dyn LogSource>,
}

impl MessageFetcher {
    pub fn new(log: Arc<dyn LogSource>) -> Self {
        Self { log }
    }
}

impl RowFetcher for MessageFetcher {
    fn fetch(&self, key: &MessageId) -> Result<Option<Value>> {
        match self.log.get(key)? {
            Some(message) => Ok(Some(serde_json::to_value(message)?)),
            None => Ok(None),
        }
    }
}

/// Source of thread summaries, owned by the embedding application.
pub trait ThreadSummaries: Send + Sync {
    /// Summary of the thread rooted at `root`.
    fn summary(&self, root: &MessageId) -> Result<Value>;
}

/// Fetches the thread summary for a row's key.
pub struct ThreadFetcher {
    threads: Arc<dyn ThreadSummaries>,
}

impl ThreadFetcher {
    pub fn new(threads: Arc<dyn ThreadSummaries>) -> Self {
        Self { threads }
    }
}

impl RowFetcher for ThreadFetcher {
    fn fetch(&self, key: &MessageId) -> Result<Option<Value>> {
        let summary = self.threads.summary(key).map_err(|e| IndexError::Fetch {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(summary))
    }
}
