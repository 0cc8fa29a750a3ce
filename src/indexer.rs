//! Main Indexer struct tying all components together.

use crate::barrier::SyncBarrier;
use crate::error::{IndexError, Result};
use crate::events::{BusConfig, EventSubscription, IndexEvent, NotificationBus, SubscriptionId};
use crate::index::{IndexCounts, IndexSet, Row, INBOX, NOTICES, RECENCY_WINDOW};
use crate::log::LogSource;
use crate::pipeline::{Classifier, IngestStats, Ingestor};
use crate::query::{
    IndexStream, KeyFn, MessageFetcher, QueryOptions, RowFetcher, ThreadFetcher, ThreadSummaries,
};
use crate::readstate::{ReadStateOp, ReadStateStore};
use crate::types::{LogEntry, MessageId};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Indexer configuration.
#[derive(Clone, Debug)]
pub struct IndexerConfig {
    /// Names of the indexes to maintain.
    pub indexes: Vec<String>,

    /// Rows newer than this publish live add events.
    pub recency_window: Duration,

    /// Rows enriched concurrently per query.
    pub fetch_concurrency: usize,

    /// Events buffered per subscriber before it is dropped.
    pub event_buffer_size: usize,

    /// Log position to start ingesting from.
    pub from_offset: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            indexes: vec![INBOX.to_string(), NOTICES.to_string()],
            recency_window: RECENCY_WINDOW,
            fetch_concurrency: 4,
            event_buffer_size: 1000,
            from_offset: 0,
        }
    }
}

impl IndexerConfig {
    fn validate(&self) -> Result<()> {
        if self.indexes.is_empty() {
            return Err(IndexError::InvalidConfig("no indexes configured".into()));
        }
        if self.event_buffer_size == 0 {
            return Err(IndexError::InvalidConfig(
                "event_buffer_size must be at least 1".into(),
            ));
        }
        if self.fetch_concurrency == 0 {
            return Err(IndexError::InvalidConfig(
                "fetch_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// The services the indexer is built on, owned by the embedding application.
#[derive(Clone)]
pub struct Collaborators {
    pub log: Arc<dyn LogSource>,
    pub classifier: Arc<dyn Classifier>,
    pub read_state: Arc<dyn ReadStateStore>,
    /// Needed only for threads-mode queries.
    pub threads: Option<Arc<dyn ThreadSummaries>>,
}

impl Collaborators {
    pub fn new(
        log: Arc<dyn LogSource>,
        classifier: Arc<dyn Classifier>,
        read_state: Arc<dyn ReadStateStore>,
    ) -> Self {
        Self {
            log,
            classifier,
            read_state,
            threads: None,
        }
    }

    pub fn with_threads(mut self, threads: Arc<dyn ThreadSummaries>) -> Self {
        self.threads = Some(threads);
        self
    }
}

/// State shared between the facade and the ingestion thread.
pub(crate) struct Shared {
    pub(crate) indexes: Arc<RwLock<IndexSet>>,
    pub(crate) barrier: SyncBarrier,
    pub(crate) bus: NotificationBus,
    pub(crate) read_state: Arc<dyn ReadStateStore>,
    /// Held from a read-state lookup until the row it feeds is upserted, and
    /// from a read-state write until the cached flags are flipped. Taken
    /// before the index lock and never across a barrier wait.
    pub(crate) read_gate: Mutex<()>,
    /// Set once the ingestion thread has consumed the log backlog.
    pub(crate) backlog_read: AtomicBool,
}

impl Shared {
    pub(crate) fn new(indexes: IndexSet, read_state: Arc<dyn ReadStateStore>) -> Self {
        Self {
            indexes: Arc::new(RwLock::new(indexes)),
            barrier: SyncBarrier::new(),
            bus: NotificationBus::new(),
            read_state,
            read_gate: Mutex::new(()),
            backlog_read: AtomicBool::new(false),
        }
    }

    /// Publish an index-change event once pending work settles.
    ///
    /// Must not be called with the index lock held: the event may be
    /// computed inline.
    pub(crate) fn emit_index_change(self: &Arc<Self>, index: &str) {
        // backlog changes never reach subscribers
        if !self.backlog_read.load(Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(self);
        let index = index.to_string();
        self.barrier.await_sync(move || {
            let (counts, count) = {
                let indexes = shared.indexes.read();
                let counts = indexes.counts();
                let count = counts.get(&index);
                (counts, count)
            };
            let Some(count) = count else {
                return;
            };
            shared.bus.publish(IndexEvent::IndexChange {
                index,
                total: count.total,
                unread: count.unread,
                counts,
            });
        });
    }
}

/// Read/unread-tracked indexes over a message log.
///
/// Starting an indexer spawns the ingestion thread, which indexes the
/// log's backlog and then follows it live. Every read waits for pending
/// index work to settle first.
pub struct Indexer {
    shared: Arc<Shared>,
    log: Arc<dyn LogSource>,
    threads: Option<Arc<dyn ThreadSummaries>>,
    ingestor: Ingestor,
    config: IndexerConfig,
}

impl Indexer {
    /// Build the indexes and start ingesting.
    pub fn start(config: IndexerConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let Collaborators {
            log,
            classifier,
            read_state,
            threads,
        } = collaborators;

        let indexes = IndexSet::new(config.indexes.iter(), config.recency_window);
        let shared = Arc::new(Shared::new(indexes, read_state));
        let ingestor = Ingestor::start(
            Arc::clone(&shared),
            Arc::clone(&log),
            classifier,
            config.from_offset,
        )?;

        tracing::info!(indexes = ?config.indexes, from = config.from_offset, "indexer started");

        Ok(Self {
            shared,
            log,
            threads,
            ingestor,
            config,
        })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// The barrier gating reads. Clones share state with the indexer.
    pub fn barrier(&self) -> &SyncBarrier {
        &self.shared.barrier
    }

    /// Block until no index work is pending.
    pub fn wait_sync(&self) {
        self.shared.barrier.wait();
    }

    /// Like [`wait_sync`](Self::wait_sync), giving up after `timeout`.
    pub fn wait_sync_timeout(&self, timeout: Duration) -> bool {
        self.shared.barrier.wait_timeout(timeout)
    }

    /// Whether the log backlog has been fully indexed.
    pub fn is_history_synced(&self) -> bool {
        self.shared.bus.is_history_synced()
    }

    pub fn ingest_stats(&self) -> &IngestStats {
        self.ingestor.stats()
    }

    /// Stop following the log. Indexes stay readable.
    pub fn stop(&mut self) -> Result<()> {
        self.ingestor.stop()
    }

    // --- Events ---

    /// Subscribe to index events with the configured buffer size.
    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_with(BusConfig {
            buffer_size: self.config.event_buffer_size,
        })
    }

    pub fn subscribe_with(&self, config: BusConfig) -> EventSubscription {
        self.shared.bus.subscribe(config)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.bus.unsubscribe(id);
    }

    // --- Counts ---

    /// Total and unread counts of every index.
    pub fn index_counts(&self) -> IndexCounts {
        self.wait_sync();
        self.shared.indexes.read().counts()
    }

    /// Rows at or after the index's last access.
    pub fn count_untouched(&self, index: &str) -> Result<usize> {
        self.wait_sync();
        Ok(self.shared.indexes.read().get(index)?.count_untouched())
    }

    /// Whether `key` is indexed in `index`.
    pub fn contains(&self, index: &str, key: &MessageId) -> Result<bool> {
        self.wait_sync();
        Ok(self.shared.indexes.read().get(index)?.contains(key))
    }

    /// A copy of every row of `index`, newest first. Does not touch the
    /// index.
    pub fn rows(&self, index: &str) -> Result<Vec<Row>> {
        self.wait_sync();
        Ok(self.shared.indexes.read().get(index)?.rows())
    }

    // --- Queries ---

    /// Stream the rows of `index`.
    pub fn query(&self, index: &str, opts: &QueryOptions) -> Result<IndexStream> {
        self.query_with_key(index, opts, None)
    }

    /// Stream the rows of `index`, delivering each under the key chosen by
    /// `key_fn`.
    pub fn query_with_key(
        &self,
        index: &str,
        opts: &QueryOptions,
        key_fn: Option<KeyFn>,
    ) -> Result<IndexStream> {
        let fetcher: Arc<dyn RowFetcher> = if opts.threads {
            let threads = self.threads.clone().ok_or_else(|| {
                IndexError::InvalidConfig("threads query without thread summaries".into())
            })?;
            Arc::new(ThreadFetcher::new(threads))
        } else {
            Arc::new(MessageFetcher::new(Arc::clone(&self.log)))
        };

        IndexStream::open(
            &self.shared.indexes,
            &self.shared.barrier,
            index,
            opts,
            key_fn,
            fetcher,
            self.config.fetch_concurrency,
        )
    }

    /// Stream the inbox.
    pub fn inbox(&self, opts: &QueryOptions) -> Result<IndexStream> {
        self.query(INBOX, opts)
    }

    /// Stream the notices.
    pub fn notices(&self, opts: &QueryOptions) -> Result<IndexStream> {
        self.query(NOTICES, opts)
    }

    /// Case-insensitive substring search over post texts, newest arrival
    /// first.
    pub fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let needle = query.to_lowercase();
        let mut hits: Vec<LogEntry> = self
            .log
            .messages_by_type("post")?
            .into_iter()
            .filter(|entry| {
                entry
                    .value
                    .text()
                    .map_or(false, |text| text.to_lowercase().contains(&needle))
            })
            .collect();
        hits.reverse();
        hits.truncate(limit.filter(|&n| n > 0).unwrap_or(usize::MAX));
        Ok(hits)
    }

    // --- Read state ---

    /// Whether `key` is marked read in the durable store.
    pub fn is_read(&self, key: &MessageId) -> Result<bool> {
        self.shared.read_state.get(key)
    }

    pub fn is_read_batch(&self, keys: &[MessageId]) -> Result<Vec<bool>> {
        self.shared.read_state.get_many(keys)
    }

    pub fn mark_read(&self, key: &MessageId) -> Result<()> {
        self.set_read(std::slice::from_ref(key), true)
    }

    /// Mark several messages read with one atomic store write.
    pub fn mark_read_batch(&self, keys: &[MessageId]) -> Result<()> {
        self.set_read(keys, true)
    }

    pub fn mark_unread(&self, key: &MessageId) -> Result<()> {
        self.set_read(std::slice::from_ref(key), false)
    }

    pub fn mark_unread_batch(&self, keys: &[MessageId]) -> Result<()> {
        self.set_read(keys, false)
    }

    /// Flip the read flag of `key`. Returns the new flag.
    pub fn toggle_read(&self, key: &MessageId) -> Result<bool> {
        let is_read = !self.is_read(key)?;
        self.set_read(std::slice::from_ref(key), is_read)?;
        Ok(is_read)
    }

    /// Mark every unread row of `index` read. Returns how many were marked.
    pub fn mark_all_read(&self, index: &str) -> Result<usize> {
        self.wait_sync();
        let keys = self.shared.indexes.read().get(index)?.unread_keys();
        if keys.is_empty() {
            return Ok(0);
        }
        self.set_read(&keys, true)?;
        Ok(keys.len())
    }

    /// Store first, cached flags second, events last.
    fn set_read(&self, keys: &[MessageId], is_read: bool) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.wait_sync();
        let gate = self.shared.read_gate.lock();

        match keys {
            [key] if is_read => self.shared.read_state.put(key)?,
            [key] => self.shared.read_state.delete(key)?,
            _ => {
                let ops: Vec<ReadStateOp> = keys
                    .iter()
                    .map(|key| {
                        if is_read {
                            ReadStateOp::Put(key.clone())
                        } else {
                            ReadStateOp::Delete(key.clone())
                        }
                    })
                    .collect();
                self.shared.read_state.batch(&ops)?;
            }
        }

        let changed: Vec<String> = {
            let mut indexes = self.shared.indexes.write();
            keys.iter()
                .flat_map(|key| indexes.set_read(key, is_read))
                .collect()
        };
        drop(gate);

        tracing::debug!(keys = keys.len(), is_read, flipped = changed.len(), "read state updated");

        for index in &changed {
            self.shared.emit_index_change(index);
        }
        for key in keys {
            self.shared.bus.publish(IndexEvent::IsRead {
                key: key.clone(),
                value: is_read,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("config", &self.config)
            .field("barrier", &self.shared.barrier)
            .field("history_synced", &self.is_history_synced())
            .finish()
    }
}
