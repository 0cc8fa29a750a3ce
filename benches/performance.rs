//! Performance benchmarks for the indexer.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use feedindex::{
    Classifier, Collaborators, Indexer, IndexerConfig, JournalConfig, JournalReadState, LogEntry,
    MemoryLog, MemoryReadState, Message, MessageId, Placement, QueryOptions, ReadStateStore,
    Result, Routing, SortedIndex, Timestamp, INBOX,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn to_inbox() -> Arc<dyn Classifier> {
    Arc::new(|entry: &LogEntry| -> Result<Routing> {
        Ok(Routing::none().place(Placement::new(
            INBOX,
            entry.key.clone(),
            entry.value.timestamp,
        )))
    })
}

fn seeded_log(count: usize) -> Arc<MemoryLog> {
    // scrambled timestamps so inserts land all over the index
    seeded_log_with(count, |i| ((i * 7919) % 100_000) as i64)
}

fn seeded_log_with(count: usize, ts: impl Fn(usize) -> i64) -> Arc<MemoryLog> {
    let log = Arc::new(MemoryLog::new());
    for i in 0..count {
        log.append_with_key(
            MessageId::from(format!("%{}", i)),
            Message::new(
                "@bob",
                Timestamp(ts(i)),
                "post",
                json!({ "text": format!("message {}", i) }),
            ),
        );
    }
    log
}

/// Benchmark upserts into a single index of varying size
fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("upsert");

    for size in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("rows", size), &size, |b, &size| {
            let mut index = SortedIndex::new(INBOX);
            for i in 0..size {
                index.upsert(Timestamp((i * 7919 % 100_000) as i64), MessageId::from(format!("%{}", i)));
            }
            let mut ts = 100_000i64;
            b.iter(|| {
                // bump an existing key to the top
                ts += 1;
                let key = MessageId::from(format!("%{}", ts as usize % size));
                black_box(index.upsert(Timestamp(ts), key));
            });
        });
    }

    group.finish();
}

/// Benchmark replaying a backlog into fresh indexes
fn bench_backlog_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("backlog_replay");
    group.sample_size(20);

    let replay = |log: &Arc<MemoryLog>| {
        let indexer = Indexer::start(
            IndexerConfig::default(),
            Collaborators::new(log.clone(), to_inbox(), Arc::new(MemoryReadState::new())),
        )
        .unwrap();
        indexer.wait_sync();
        black_box(indexer.index_counts());
    };

    for count in [1_000, 5_000] {
        let log = seeded_log(count);
        group.bench_with_input(BenchmarkId::new("entries", count), &count, |b, _| {
            b.iter(|| replay(&log));
        });
    }

    // oldest first, the usual log order: every row lands on top
    for count in [10_000, 50_000] {
        let log = seeded_log_with(count, |i| i as i64);
        group.bench_with_input(BenchmarkId::new("ascending", count), &count, |b, _| {
            b.iter(|| replay(&log));
        });
    }

    group.finish();
}

/// Benchmark paginated historical queries with enrichment
fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");
    let log = seeded_log(10_000);
    let indexer = Indexer::start(
        IndexerConfig::default(),
        Collaborators::new(log, to_inbox(), Arc::new(MemoryReadState::new())),
    )
    .unwrap();
    indexer.wait_sync();

    for limit in [10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("limit", limit), &limit, |b, &limit| {
            b.iter(|| {
                let rows = indexer.inbox(&QueryOptions::new().limit(limit)).unwrap();
                black_box(rows.count());
            });
        });
    }

    group.finish();
}

/// Benchmark durable mark-read writes
fn bench_journal_writes(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let journal = JournalReadState::open(JournalConfig {
        path: dir.path().join("readstate"),
        ..Default::default()
    })
    .unwrap();

    let mut i = 0u64;
    c.bench_function("journal_put", |b| {
        b.iter(|| {
            i += 1;
            journal.put(&MessageId::from(format!("%{}", i))).unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_upsert,
    bench_backlog_replay,
    bench_query,
    bench_journal_writes,
);

criterion_main!(benches);
