//! # Feed Index
//!
//! Live, read/unread-tracked views over an append-only log of signed
//! messages.
//!
//! ## Core Concepts
//!
//! - **Indexes**: Time-ordered rows (`inbox`, `notices`) rebuilt from the log on start
//! - **Sync barrier**: Reads wait until every in-flight index update has landed
//! - **Read state**: Durable read markers mirrored onto each row
//! - **Queries**: Historical rows plus an optional live tail, enriched concurrently
//! - **Events**: Index changes and read-state flips pushed to subscribers
//!
//! ## Example
//!
//! ```ignore
//! use feedindex::{Collaborators, Indexer, IndexerConfig, MemoryLog, MemoryReadState,
//!     QueryOptions, RuleClassifier};
//! use std::sync::Arc;
//!
//! let log = Arc::new(MemoryLog::new());
//! let classifier = Arc::new(RuleClassifier::new("@me", log.clone()));
//! let indexer = Indexer::start(
//!     IndexerConfig::default(),
//!     Collaborators::new(log, classifier, Arc::new(MemoryReadState::new())),
//! )?;
//!
//! // Read the inbox, then keep following it
//! for row in indexer.inbox(&QueryOptions::new().live())? {
//!     println!("{} new={} read={}", row.key, row.is_new, row.is_read);
//! }
//! ```

pub mod barrier;
pub mod error;
pub mod events;
pub mod index;
pub mod indexer;
pub mod log;
pub mod pipeline;
pub mod query;
pub mod readstate;
pub mod types;

// Re-exports
pub use barrier::{InFlight, SyncBarrier};
pub use error::{IndexError, Result};
pub use events::{
    BusConfig, DropReason, EventSubscription, IndexEvent, NotificationBus, SubscriptionId,
};
pub use index::{
    Applied, Extra, IndexCount, IndexCounts, IndexSet, ListenerId, Outcome, Row, SortedIndex,
    INBOX, NOTICES, RECENCY_WINDOW,
};
pub use indexer::{Collaborators, Indexer, IndexerConfig};
pub use log::{LogEvent, LogSource, MemoryLog};
pub use pipeline::{Classifier, DomainEvent, IngestStats, Ingestor, Placement, Routing, RuleClassifier};
pub use query::{
    Cursor, IndexStream, KeyFn, MessageFetcher, QueryOptions, QueryRow, RowFetcher,
    ThreadFetcher, ThreadSummaries,
};
pub use readstate::{JournalConfig, JournalReadState, MemoryReadState, ReadStateOp, ReadStateStore};
pub use types::*;
