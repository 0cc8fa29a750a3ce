//! Reading indexes.
//!
//! A query yields the rows of one index newest first, each enriched with a
//! value fetched by a [`RowFetcher`]: the message itself by default, or a
//! thread summary in threads mode. With `live` set, the stream continues
//! with rows added after it was opened.
//!
//! Range bounds compare timestamps only. Live rows bypass the range and
//! unread filters.

mod fetch;
mod options;
mod stream;

pub use fetch::{MessageFetcher, RowFetcher, ThreadFetcher, ThreadSummaries};
pub use options::{Cursor, QueryOptions, QueryRow};
pub use stream::{IndexStream, KeyFn};
