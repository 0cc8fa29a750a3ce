//! Sorted indexes over the message log.
//!
//! Each index is a sequence of rows ordered by asserted timestamp, newest
//! first, with O(log n) lookup by message identity and live "add" listeners
//! gated by a recency window.

mod set;
mod sorted;

pub use set::{IndexCount, IndexCounts, IndexSet, INBOX, NOTICES};
pub use sorted::{Applied, Extra, ListenerId, Outcome, Row, SortedIndex, RECENCY_WINDOW};
