//! Streaming reads over one index.

use super::fetch::RowFetcher;
use super::options::{QueryOptions, QueryRow};
use crate::barrier::SyncBarrier;
use crate::error::Result;
use crate::index::{IndexSet, Row};
use crate::types::{MessageId, Timestamp};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// Maps an index row to the key delivered to the consumer. Rows mapped to
/// `None` are skipped.
pub type KeyFn = Arc<dyn Fn(&Row) -> Option<MessageId> + Send + Sync>;

type Detach = Box<dyn FnOnce() + Send>;

/// The live half of a stream. Detaches its listener when dropped.
struct LiveTail {
    rows: Receiver<Row>,
    detach: Option<Detach>,
}

impl Drop for LiveTail {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// Worker threads enriching rows with fetched values.
struct FetchPool {
    jobs: Sender<(u64, QueryRow)>,
    results: Receiver<(u64, QueryRow)>,
}

impl FetchPool {
    fn start(fetcher: Arc<dyn RowFetcher>, workers: usize) -> Result<Self> {
        let (jobs, job_rx) = unbounded::<(u64, QueryRow)>();
        let (result_tx, results) = unbounded();

        for i in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let fetcher = Arc::clone(&fetcher);

            thread::Builder::new()
                .name(format!("feedindex-fetch-{}", i))
                .spawn(move || {
                    for (seq, mut row) in job_rx.iter() {
                        row.value = enrich(fetcher.as_ref(), &row.key);
                        if result_tx.send((seq, row)).is_err() {
                            break;
                        }
                    }
                })?;
        }

        Ok(Self { jobs, results })
    }
}

fn enrich(fetcher: &dyn RowFetcher, key: &MessageId) -> Option<Value> {
    match panic::catch_unwind(AssertUnwindSafe(|| fetcher.fetch(key))) {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            tracing::debug!(key = %key, error = %e, "row enrichment failed");
            None
        }
        Err(_) => {
            tracing::warn!(key = %key, "row fetcher panicked");
            None
        }
    }
}

/// Rows of one index, newest first, optionally followed by a live tail.
///
/// Enrichment runs on up to `concurrency` rows at once; rows are still
/// yielded in order. A live stream blocks in [`next`](Iterator::next)
/// until a new row arrives and ends only when the index goes away.
/// Dropping the stream detaches the live listener and discards any
/// enrichment still in progress.
pub struct IndexStream {
    historical: std::vec::IntoIter<QueryRow>,
    live: Option<LiveTail>,
    key_fn: Option<KeyFn>,
    last_accessed: Timestamp,
    pool: FetchPool,
    concurrency: u64,
    /// Sequence number of the next row handed to the pool.
    submitted: u64,
    /// Sequence number of the next row to yield.
    emitted: u64,
    ready: BTreeMap<u64, QueryRow>,
}

impl IndexStream {
    /// Open a stream over `index`.
    ///
    /// Blocks until pending index work settles. The previous access time
    /// is captured, the index is touched, the historical snapshot is taken
    /// and the live listener is attached under one write lock, so no row
    /// can be missed or delivered twice between the two halves.
    pub(crate) fn open(
        indexes: &Arc<RwLock<IndexSet>>,
        barrier: &SyncBarrier,
        index: &str,
        opts: &QueryOptions,
        key_fn: Option<KeyFn>,
        fetcher: Arc<dyn RowFetcher>,
        concurrency: usize,
    ) -> Result<Self> {
        // reject unknown names before waiting
        indexes.read().get(index)?;
        barrier.wait();

        let (historical, live, last_accessed) = {
            let mut guard = indexes.write();
            let target = guard.get_mut(index)?;
            let last_accessed = target.touch();

            let historical: Vec<QueryRow> = target
                .iter()
                .filter(|row| opts.admits(row))
                .filter_map(|row| lift(&key_fn, last_accessed, row))
                .take(opts.max_rows())
                .collect();

            let live = if opts.live {
                let (id, rows) = target.attach();
                let shared = Arc::clone(indexes);
                let name = index.to_string();
                let detach: Detach = Box::new(move || {
                    if let Ok(target) = shared.write().get_mut(&name) {
                        target.detach(id);
                    }
                });
                Some(LiveTail {
                    rows,
                    detach: Some(detach),
                })
            } else {
                None
            };

            (historical, live, last_accessed)
        };

        tracing::debug!(
            index,
            rows = historical.len(),
            live = opts.live,
            "query opened"
        );

        let concurrency = concurrency.max(1);
        let workers = if live.is_some() {
            concurrency
        } else {
            concurrency.min(historical.len())
        };
        let pool = FetchPool::start(fetcher, workers)?;

        Ok(Self {
            historical: historical.into_iter(),
            live,
            key_fn,
            last_accessed,
            pool,
            concurrency: concurrency as u64,
            submitted: 0,
            emitted: 0,
            ready: BTreeMap::new(),
        })
    }

    /// The index's access time before this query touched it.
    pub fn last_accessed(&self) -> Timestamp {
        self.last_accessed
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    fn outstanding(&self) -> u64 {
        self.submitted - self.emitted
    }

    fn submit(&mut self, row: QueryRow) -> Option<()> {
        self.pool.jobs.send((self.submitted, row)).ok()?;
        self.submitted += 1;
        Some(())
    }

    /// Next source row without blocking.
    fn poll_source(&mut self) -> Option<QueryRow> {
        if let Some(row) = self.historical.next() {
            return Some(row);
        }
        let live = self.live.as_ref()?;
        loop {
            let row = live.rows.try_recv().ok()?;
            if let Some(row) = lift(&self.key_fn, self.last_accessed, &row) {
                return Some(row);
            }
        }
    }

    /// Block for the next live row. `None` when there is no live tail or
    /// the index went away.
    fn wait_live(&mut self) -> Option<QueryRow> {
        let live = self.live.as_ref()?;
        loop {
            let row = live.rows.recv().ok()?;
            if let Some(row) = lift(&self.key_fn, self.last_accessed, &row) {
                return Some(row);
            }
        }
    }
}

impl Iterator for IndexStream {
    type Item = QueryRow;

    fn next(&mut self) -> Option<QueryRow> {
        loop {
            if let Some(row) = self.ready.remove(&self.emitted) {
                self.emitted += 1;
                return Some(row);
            }

            while self.outstanding() < self.concurrency {
                match self.poll_source() {
                    Some(row) => self.submit(row)?,
                    None => break,
                }
            }

            if self.outstanding() == 0 {
                let row = self.wait_live()?;
                self.submit(row)?;
                continue;
            }

            let (seq, row) = self.pool.results.recv().ok()?;
            self.ready.insert(seq, row);
        }
    }
}

fn lift(key_fn: &Option<KeyFn>, last_accessed: Timestamp, row: &Row) -> Option<QueryRow> {
    let key = match key_fn {
        Some(key_fn) => key_fn(row)?,
        None => row.key.clone(),
    };
    Some(QueryRow::from_row(row, key, last_accessed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexError;
    use crate::index::{INBOX, RECENCY_WINDOW};
    use serde_json::json;
    use std::time::Duration;

    fn setup(rows: &[(i64, &str)]) -> Arc<RwLock<IndexSet>> {
        let mut set = IndexSet::new([INBOX], RECENCY_WINDOW);
        {
            let inbox = set.get_mut(INBOX).unwrap();
            for (ts, key) in rows {
                inbox.upsert(Timestamp(*ts), MessageId::from(*key));
            }
        }
        Arc::new(RwLock::new(set))
    }

    fn echo() -> Arc<dyn RowFetcher> {
        Arc::new(|key: &MessageId| -> Result<Option<Value>> { Ok(Some(json!(key.as_str()))) })
    }

    fn open(
        indexes: &Arc<RwLock<IndexSet>>,
        opts: QueryOptions,
        fetcher: Arc<dyn RowFetcher>,
    ) -> IndexStream {
        IndexStream::open(indexes, &SyncBarrier::new(), INBOX, &opts, None, fetcher, 4).unwrap()
    }

    fn keys(rows: &[QueryRow]) -> Vec<&str> {
        rows.iter().map(|r| r.key.as_str()).collect()
    }

    #[test]
    fn test_historical_in_order_with_values() {
        let indexes = setup(&[(1, "%a"), (3, "%c"), (2, "%b")]);
        let rows: Vec<_> = open(&indexes, QueryOptions::new(), echo()).collect();

        assert_eq!(keys(&rows), vec!["%c", "%b", "%a"]);
        assert!(rows.iter().all(|r| r.value == Some(json!(r.key.as_str()))));
    }

    #[test]
    fn test_order_survives_uneven_fetch_latency() {
        let entries: Vec<(i64, String)> = (0..40).map(|i| (i, format!("%{:02}", i))).collect();
        let borrowed: Vec<(i64, &str)> = entries.iter().map(|(t, k)| (*t, k.as_str())).collect();
        let indexes = setup(&borrowed);

        let slow_evens: Arc<dyn RowFetcher> =
            Arc::new(|key: &MessageId| -> Result<Option<Value>> {
                if key.as_str().ends_with(['0', '2', '4', '6', '8']) {
                    thread::sleep(Duration::from_millis(3));
                }
                Ok(Some(json!(key.as_str())))
            });
        let rows: Vec<_> = open(&indexes, QueryOptions::new(), slow_evens).collect();

        let ts: Vec<i64> = rows.iter().map(|r| r.ts.0).collect();
        let expected: Vec<i64> = (0..40).rev().collect();
        assert_eq!(ts, expected);
    }

    #[test]
    fn test_fetch_failure_yields_no_value() {
        let indexes = setup(&[(1, "%a"), (2, "%b")]);
        let failing: Arc<dyn RowFetcher> = Arc::new(|key: &MessageId| -> Result<Option<Value>> {
            if key.as_str() == "%b" {
                return Err(IndexError::MessageNotFound(key.clone()));
            }
            Ok(Some(json!(1)))
        });
        let rows: Vec<_> = open(&indexes, QueryOptions::new(), failing).collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, None);
        assert_eq!(rows[1].value, Some(json!(1)));
    }

    #[test]
    fn test_limit_and_filters() {
        let indexes = setup(&[(1, "%a"), (2, "%b"), (3, "%c"), (4, "%d")]);
        indexes
            .write()
            .get_mut(INBOX)
            .unwrap()
            .set_read(&MessageId::from("%c"), true);

        let rows: Vec<_> = open(&indexes, QueryOptions::new().unread().limit(2), echo()).collect();
        assert_eq!(keys(&rows), vec!["%d", "%b"]);

        let rows: Vec<_> = open(&indexes, QueryOptions::new().lt(Timestamp(4)).gte(Timestamp(2)), echo()).collect();
        assert_eq!(keys(&rows), vec!["%c", "%b"]);

        // zero is no limit
        let rows: Vec<_> = open(&indexes, QueryOptions::new().limit(0), echo()).collect();
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn test_is_new_relative_to_previous_access() {
        let now = Timestamp::now().0;
        let indexes = setup(&[(now - 10_000, "%old")]);

        // first read: never accessed before, everything is new
        let rows: Vec<_> = open(&indexes, QueryOptions::new(), echo()).collect();
        assert!(rows[0].is_new);

        // second read: touched by the first
        let rows: Vec<_> = open(&indexes, QueryOptions::new(), echo()).collect();
        assert!(!rows[0].is_new);
    }

    #[test]
    fn test_key_remap_skips_unmapped_rows() {
        let indexes = setup(&[(1, "%a"), (2, "%b")]);
        let key_fn: KeyFn = Arc::new(|row: &Row| {
            (row.key.as_str() == "%a").then(|| MessageId::from("%root"))
        });
        let rows: Vec<_> = IndexStream::open(
            &indexes,
            &SyncBarrier::new(),
            INBOX,
            &QueryOptions::new(),
            Some(key_fn),
            echo(),
            2,
        )
        .unwrap()
        .collect();

        assert_eq!(keys(&rows), vec!["%root"]);
        assert_eq!(rows[0].value, Some(json!("%root")));
    }

    #[test]
    fn test_live_tail_and_detach() {
        let now = Timestamp::now().0;
        let indexes = setup(&[(now - 1000, "%a")]);
        let mut stream = open(&indexes, QueryOptions::new().live(), echo());
        assert_eq!(indexes.read().get(INBOX).unwrap().listener_count(), 1);

        assert_eq!(stream.next().unwrap().key.as_str(), "%a");

        let writer = {
            let indexes = Arc::clone(&indexes);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                indexes
                    .write()
                    .get_mut(INBOX)
                    .unwrap()
                    .upsert(Timestamp(now), MessageId::from("%live"));
            })
        };
        let row = stream.next().unwrap();
        writer.join().unwrap();
        assert_eq!(row.key.as_str(), "%live");
        assert_eq!(row.value, Some(json!("%live")));

        drop(stream);
        assert_eq!(indexes.read().get(INBOX).unwrap().listener_count(), 0);
    }

    #[test]
    fn test_unknown_index() {
        let indexes = setup(&[]);
        let err = IndexStream::open(
            &indexes,
            &SyncBarrier::new(),
            "nope",
            &QueryOptions::new(),
            None,
            echo(),
            4,
        )
        .err()
        .unwrap();
        assert!(matches!(err, IndexError::UnknownIndex(name) if name == "nope"));
    }

    #[test]
    fn test_waits_for_pending_work() {
        let indexes = setup(&[]);
        let barrier = SyncBarrier::new();
        let guard = barrier.acquire();

        let writer = {
            let indexes = Arc::clone(&indexes);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                indexes
                    .write()
                    .get_mut(INBOX)
                    .unwrap()
                    .upsert(Timestamp(5), MessageId::from("%late"));
                drop(guard);
            })
        };

        let rows: Vec<_> =
            IndexStream::open(&indexes, &barrier, INBOX, &QueryOptions::new(), None, echo(), 4)
                .unwrap()
                .collect();
        writer.join().unwrap();
        assert_eq!(keys(&rows), vec!["%late"]);
    }
}
