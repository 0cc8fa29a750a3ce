//! The ingestion thread.

use super::classify::{Classifier, DomainEvent, Placement};
use crate::barrier::InFlight;
use crate::error::{IndexError, Result};
use crate::events::IndexEvent;
use crate::index::Outcome;
use crate::indexer::Shared;
use crate::log::{LogEvent, LogSource};
use crate::types::LogEntry;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Counters kept by the ingestion thread.
#[derive(Debug, Default)]
pub struct IngestStats {
    processed: AtomicU64,
    placed: AtomicU64,
    skipped: AtomicU64,
}

impl IngestStats {
    /// Entries taken off the log.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Placements that inserted or moved a row.
    pub fn placed(&self) -> u64 {
        self.placed.load(Ordering::Relaxed)
    }

    /// Entries or placements dropped after an error.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Handle to the running ingestion thread.
///
/// The thread consumes the log stream until the log ends or
/// [`stop`](Self::stop) is called.
pub struct Ingestor {
    handle: Option<JoinHandle<()>>,
    stop: Option<Sender<()>>,
    stats: Arc<IngestStats>,
}

impl Ingestor {
    /// Open the log stream at `from` and start consuming it.
    ///
    /// The history unit of work is acquired before the thread starts, so a
    /// gated read issued right after this returns already waits for the
    /// backlog.
    pub(crate) fn start(
        shared: Arc<Shared>,
        log: Arc<dyn LogSource>,
        classifier: Arc<dyn Classifier>,
        from: u64,
    ) -> Result<Self> {
        let history = shared.barrier.acquire();
        let events = log.stream(from);
        let (stop_tx, stop_rx) = bounded(1);
        let stats = Arc::new(IngestStats::default());

        let worker = Worker {
            shared,
            classifier,
            stats: Arc::clone(&stats),
        };
        let handle = thread::Builder::new()
            .name("feedindex-ingest".into())
            .spawn(move || worker.run(events, stop_rx, history))?;

        Ok(Self {
            handle: Some(handle),
            stop: Some(stop_tx),
            stats,
        })
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Ask the thread to exit after its current entry and wait for it.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.join()
    }

    /// Wait for the thread to exit.
    pub fn join(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| IndexError::IngestPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for Ingestor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "ingestion thread did not exit cleanly");
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    classifier: Arc<dyn Classifier>,
    stats: Arc<IngestStats>,
}

impl Worker {
    fn run(
        self,
        events: Receiver<LogEvent>,
        stop: Receiver<()>,
        history: InFlight,
    ) {
        let mut history = Some(history);

        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(LogEvent::Entry(entry)) => self.process(entry),
                    Ok(LogEvent::Synced) => {
                        if let Some(guard) = history.take() {
                            self.shared.backlog_read.store(true, Ordering::SeqCst);
                            tracing::debug!(
                                processed = self.stats.processed(),
                                "log history read"
                            );
                            let shared = Arc::clone(&self.shared);
                            self.shared.barrier.await_sync(move || {
                                shared.bus.mark_history_synced();
                                tracing::info!("indexes generated");
                            });
                            drop(guard);
                        }
                    }
                    Err(_) => {
                        tracing::debug!("log stream ended");
                        break;
                    }
                },
                recv(stop) -> _ => {
                    tracing::debug!("ingestion stopped");
                    break;
                }
            }
        }
    }

    fn process(&self, entry: LogEntry) {
        let _work = self.shared.barrier.acquire();
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        let routing = match self.classifier.classify(&entry) {
            Ok(routing) => routing,
            Err(e) => {
                tracing::warn!(key = %entry.key, error = %e, "skipping unclassifiable entry");
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        for placement in routing.placements {
            self.place(placement);
        }
        for DomainEvent { kind, data } in routing.events {
            self.shared.bus.publish(IndexEvent::Domain { kind, data });
        }
    }

    fn place(&self, placement: Placement) {
        let Placement {
            index,
            key,
            ts,
            extra,
            is_read,
        } = placement;

        let gate = self.shared.read_gate.lock();
        let is_read = match is_read {
            Some(flag) => flag,
            None => self.shared.read_state.get(&key).unwrap_or_else(|e| {
                tracing::warn!(key = %key, error = %e, "read-state lookup failed, treating as unread");
                false
            }),
        };

        let changed = {
            let mut indexes = self.shared.indexes.write();
            let target = match indexes.get_mut(&index) {
                Ok(target) => target,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "classifier routed to an unknown index");
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };

            let mut flag_flipped = false;
            let applied = target.upsert_with(ts, key, |row| {
                flag_flipped = row.is_read != is_read;
                row.is_read = is_read;
                row.extra.extend(extra);
            });
            tracing::debug!(
                index = %index,
                key = %applied.row.key,
                outcome = ?applied.outcome,
                live = applied.published,
                "row placed"
            );

            match applied.outcome {
                Outcome::Inserted | Outcome::Moved => {
                    self.stats.placed.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Outcome::Unchanged => flag_flipped,
            }
        };
        drop(gate);

        if changed {
            self.shared.emit_index_change(&index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BusConfig;
    use crate::index::{IndexSet, INBOX, RECENCY_WINDOW};
    use crate::log::MemoryLog;
    use crate::pipeline::Routing;
    use crate::readstate::{MemoryReadState, ReadStateStore};
    use crate::types::{Message, MessageId, Timestamp};
    use serde_json::json;
    use std::time::Duration;

    fn shared(read_state: Arc<dyn ReadStateStore>) -> Arc<Shared> {
        Arc::new(Shared::new(
            IndexSet::new([INBOX, "other"], RECENCY_WINDOW),
            read_state,
        ))
    }

    fn everything_to_inbox() -> Arc<dyn Classifier> {
        Arc::new(|entry: &LogEntry| -> Result<Routing> {
            Ok(Routing::none().place(Placement::new(
                INBOX,
                entry.key.clone(),
                entry.value.timestamp,
            )))
        })
    }

    fn post(text: &str, ts: i64) -> Message {
        Message::new("@bob", Timestamp(ts), "post", json!({ "text": text }))
    }

    #[test]
    fn test_backlog_indexed_before_sync() {
        let log = Arc::new(MemoryLog::new());
        for i in 0..20 {
            log.append(post(&format!("m{}", i), i)).unwrap();
        }
        let shared = shared(Arc::new(MemoryReadState::new()));
        let mut ingestor =
            Ingestor::start(shared.clone(), log.clone(), everything_to_inbox(), 0).unwrap();

        assert!(shared.barrier.wait_timeout(Duration::from_secs(5)));
        assert!(shared.bus.is_history_synced());
        assert_eq!(shared.indexes.read().get(INBOX).unwrap().len(), 20);
        assert_eq!(ingestor.stats().processed(), 20);

        ingestor.stop().unwrap();
        assert!(!ingestor.is_running());
    }

    #[test]
    fn test_read_state_applied_on_ingest() {
        let log = Arc::new(MemoryLog::new());
        let a = log.append(post("a", 1)).unwrap();
        let b = log.append(post("b", 2)).unwrap();

        let read_state = Arc::new(MemoryReadState::new());
        read_state.put(&a.key).unwrap();

        let shared = shared(read_state);
        let _ingestor = Ingestor::start(shared.clone(), log, everything_to_inbox(), 0).unwrap();
        shared.barrier.wait();

        let indexes = shared.indexes.read();
        let inbox = indexes.get(INBOX).unwrap();
        assert!(inbox.find(&a.key).unwrap().is_read);
        assert!(!inbox.find(&b.key).unwrap().is_read);
    }

    #[test]
    fn test_classifier_errors_are_skipped() {
        let log = Arc::new(MemoryLog::new());
        log.append(post("bad", 1)).unwrap();
        let good = log.append(post("good", 2)).unwrap();

        let classifier: Arc<dyn Classifier> = Arc::new(|entry: &LogEntry| -> Result<Routing> {
            if entry.value.text() == Some("bad") {
                return Err(IndexError::Classification {
                    key: entry.key.clone(),
                    reason: "malformed".into(),
                });
            }
            Ok(Routing::none().place(Placement::new(
                INBOX,
                entry.key.clone(),
                entry.value.timestamp,
            )))
        });

        let shared = shared(Arc::new(MemoryReadState::new()));
        let ingestor = Ingestor::start(shared.clone(), log, classifier, 0).unwrap();
        shared.barrier.wait();

        let indexes = shared.indexes.read();
        assert_eq!(indexes.get(INBOX).unwrap().len(), 1);
        assert!(indexes.get(INBOX).unwrap().contains(&good.key));
        assert_eq!(ingestor.stats().skipped(), 1);
    }

    #[test]
    fn test_live_entries_emit_index_change() {
        let log = Arc::new(MemoryLog::new());
        log.append(post("old", 1)).unwrap();

        let shared = shared(Arc::new(MemoryReadState::new()));
        let events = shared.bus.subscribe(BusConfig::default());
        let _ingestor =
            Ingestor::start(shared.clone(), log.clone(), everything_to_inbox(), 0).unwrap();
        shared.barrier.wait();
        assert!(shared.bus.is_history_synced());

        // backlog produced no events
        assert!(events.try_recv().is_err());

        log.append(post("new", Timestamp::now().0)).unwrap();
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            IndexEvent::IndexChange {
                index,
                total,
                unread,
                ..
            } => {
                assert_eq!(index, INBOX);
                assert_eq!(total, 2);
                assert_eq!(unread, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_log_end_releases_history() {
        let log = Arc::new(MemoryLog::new());
        log.append(post("a", 1)).unwrap();
        log.close();

        let shared = shared(Arc::new(MemoryReadState::new()));
        let mut ingestor = Ingestor::start(shared.clone(), log, everything_to_inbox(), 0).unwrap();
        ingestor.join().unwrap();

        assert!(shared.barrier.is_idle());
        assert!(shared
            .indexes
            .read()
            .get(INBOX)
            .unwrap()
            .contains(&MessageId::for_message(&post("a", 1)).unwrap()));
    }
}
