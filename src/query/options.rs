//! Query options and result rows.

use crate::index::{Extra, Row};
use crate::types::{MessageId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A range bound: `[timestamp, tiebreak]`.
///
/// Only the timestamp takes part in comparisons. The tiebreak is accepted
/// for wire compatibility and ignored, so rows sharing the bound's
/// timestamp are all included or all excluded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(pub Timestamp, #[serde(default)] pub Option<String>);

impl Cursor {
    pub fn at(ts: impl Into<Timestamp>) -> Self {
        Self(ts.into(), None)
    }

    pub fn ts(&self) -> Timestamp {
        self.0
    }
}

impl From<Timestamp> for Cursor {
    fn from(ts: Timestamp) -> Self {
        Self::at(ts)
    }
}

/// Options for reading an index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub lt: Option<Cursor>,
    pub lte: Option<Cursor>,
    pub gt: Option<Cursor>,
    pub gte: Option<Cursor>,
    /// Maximum number of historical rows. Zero means no limit.
    pub limit: Option<usize>,
    /// Only unread rows.
    pub unread: bool,
    /// After the historical rows, keep emitting rows as they are added.
    pub live: bool,
    /// Enrich rows with thread summaries instead of message values.
    pub threads: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lt(mut self, bound: impl Into<Cursor>) -> Self {
        self.lt = Some(bound.into());
        self
    }

    pub fn lte(mut self, bound: impl Into<Cursor>) -> Self {
        self.lte = Some(bound.into());
        self
    }

    pub fn gt(mut self, bound: impl Into<Cursor>) -> Self {
        self.gt = Some(bound.into());
        self
    }

    pub fn gte(mut self, bound: impl Into<Cursor>) -> Self {
        self.gte = Some(bound.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The effective row cap.
    pub fn max_rows(&self) -> usize {
        match self.limit {
            Some(0) | None => usize::MAX,
            Some(n) => n,
        }
    }

    pub fn unread(mut self) -> Self {
        self.unread = true;
        self
    }

    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    pub fn threads(mut self) -> Self {
        self.threads = true;
        self
    }

    /// Whether a historical row passes the range and unread filters.
    pub fn admits(&self, row: &Row) -> bool {
        let ts = row.ts;
        self.lt.as_ref().map_or(true, |c| ts < c.ts())
            && self.lte.as_ref().map_or(true, |c| ts <= c.ts())
            && self.gt.as_ref().map_or(true, |c| ts > c.ts())
            && self.gte.as_ref().map_or(true, |c| ts >= c.ts())
            && (!self.unread || !row.is_read)
    }
}

/// A row as delivered to a query consumer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRow {
    pub key: MessageId,
    pub ts: Timestamp,
    #[serde(rename = "isread")]
    pub is_read: bool,
    /// Newer than the index's previous access.
    #[serde(rename = "isNew")]
    pub is_new: bool,
    #[serde(flatten)]
    pub extra: Extra,
    /// Message value or thread summary. `None` when not available locally.
    pub value: Option<Value>,
}

impl QueryRow {
    /// Build a result row from an index row, under a possibly remapped key.
    pub fn from_row(row: &Row, key: MessageId, last_accessed: Timestamp) -> Self {
        Self {
            key,
            ts: row.ts,
            is_read: row.is_read,
            is_new: row.ts > last_accessed,
            extra: row.extra.clone(),
            value: None,
        }
    }
}
