//! Ingestion: log entries in, index rows out.
//!
//! A single thread reads the log stream in arrival order. Each entry is one
//! unit of in-flight work on the sync barrier from the moment it is taken
//! off the stream until every placement has been applied, so gated reads
//! never observe a half-processed entry. The historical backlog is one
//! more unit, released when the log reports it is synced.

mod classify;
mod ingest;

pub use classify::{Classifier, DomainEvent, Placement, Routing, RuleClassifier};
pub use ingest::{IngestStats, Ingestor};
