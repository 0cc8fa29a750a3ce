//! Time-ordered index of message rows.

use crate::types::{MessageId, Timestamp};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Rows whose timestamp is within this distance of now publish an add event.
pub const RECENCY_WINDOW: Duration = Duration::from_secs(48 * 60 * 60);

/// Extra fields the pipeline attaches to a row.
pub type Extra = serde_json::Map<String, serde_json::Value>;

/// One entry in an index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: MessageId,
    pub ts: Timestamp,
    #[serde(rename = "isread")]
    pub is_read: bool,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Row {
    pub fn new(ts: Timestamp, key: MessageId) -> Self {
        Self {
            key,
            ts,
            is_read: false,
            extra: Extra::new(),
        }
    }
}

/// What a mutation did to the index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A new row was inserted.
    Inserted,
    /// An existing row moved to a newer timestamp.
    Moved,
    /// An existing row was kept where it was.
    Unchanged,
}

/// Result of an insert, update or upsert.
#[derive(Clone, Debug)]
pub struct Applied {
    pub outcome: Outcome,
    /// The row as it stands after the mutation.
    pub row: Row,
    /// Whether the row was sent to live listeners.
    pub published: bool,
}

/// Handle for a live "add" listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Position of a row: newest first, then arrival order.
type Slot = (Reverse<Timestamp>, u64);

/// An ordered, mutable collection of rows.
///
/// Rows are kept sorted by `ts` descending and are unique by key. Each row
/// is stored under a slot that never shifts when other rows come and go,
/// so lookups, inserts and moves are O(log n).
pub struct SortedIndex {
    name: String,
    rows: BTreeMap<Slot, Row>,
    slots: HashMap<MessageId, Slot>,
    next_seq: u64,
    unread: usize,
    last_accessed: Timestamp,
    recency_window: Duration,
    listeners: Vec<(ListenerId, Sender<Row>)>,
    next_listener: u64,
}

impl SortedIndex {
    /// Create an empty index with the default recency window.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_recency_window(name, RECENCY_WINDOW)
    }

    pub fn with_recency_window(name: impl Into<String>, recency_window: Duration) -> Self {
        Self {
            name: name.into(),
            rows: BTreeMap::new(),
            slots: HashMap::new(),
            next_seq: 0,
            unread: 0,
            last_accessed: Timestamp::now(),
            recency_window,
            listeners: Vec::new(),
            next_listener: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// A copy of the rows in index order (newest first).
    pub fn rows(&self) -> Vec<Row> {
        self.rows.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    pub fn last_accessed(&self) -> Timestamp {
        self.last_accessed
    }

    /// Mark the index as viewed now. Returns the previous access time.
    ///
    /// `last_accessed` never moves backwards.
    pub fn touch(&mut self) -> Timestamp {
        let previous = self.last_accessed;
        self.last_accessed = previous.max(Timestamp::now());
        previous
    }

    // --- Lookup ---

    /// Position of `key` in index order. Walks the rows ahead of it.
    pub fn index_of(&self, key: &MessageId) -> Option<usize> {
        let slot = self.slots.get(key)?;
        Some(self.rows.range(..slot).count())
    }

    pub fn find(&self, key: &MessageId) -> Option<&Row> {
        self.slots.get(key).and_then(|slot| self.rows.get(slot))
    }

    pub fn contains(&self, key: &MessageId) -> bool {
        self.slots.contains_key(key)
    }

    /// Number of rows at or newer than the last access time.
    pub fn count_untouched(&self) -> usize {
        self.rows
            .range(..=(Reverse(self.last_accessed), u64::MAX))
            .count()
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    pub fn unread_keys(&self) -> Vec<MessageId> {
        self.iter()
            .filter(|r| !r.is_read)
            .map(|r| r.key.clone())
            .collect()
    }

    // --- Mutation ---

    /// Insert a new row.
    ///
    /// Callers must not insert a key that is already present; use
    /// [`upsert`](Self::upsert) when that is not known.
    pub fn insert(&mut self, ts: Timestamp, key: MessageId, extra: Extra) -> Applied {
        let mut row = Row::new(ts, key);
        row.extra = extra;
        self.insert_row(row)
    }

    /// Insert a fully built row after every row with a newer or equal `ts`.
    pub fn insert_row(&mut self, row: Row) -> Applied {
        debug_assert!(!self.contains(&row.key), "duplicate key {}", row.key);

        let slot = (Reverse(row.ts), self.next_seq);
        self.next_seq += 1;
        if !row.is_read {
            self.unread += 1;
        }
        self.slots.insert(row.key.clone(), slot);
        self.rows.insert(slot, row.clone());

        let published = self.publish_if_recent(&row);
        Applied {
            outcome: Outcome::Inserted,
            row,
            published,
        }
    }

    /// Move an existing row to a newer timestamp.
    ///
    /// Returns `None` when the key is not indexed. An older or equal
    /// timestamp leaves the row where it is.
    pub fn update(&mut self, ts: Timestamp, key: &MessageId) -> Option<Applied> {
        self.update_with(ts, key, |_| {})
    }

    /// Like [`update`](Self::update), applying `fill` to the row before it is
    /// placed and published. `fill` runs whether or not the row moves.
    pub fn update_with<F>(&mut self, ts: Timestamp, key: &MessageId, fill: F) -> Option<Applied>
    where
        F: FnOnce(&mut Row),
    {
        let (slot, row) = self.take(key)?;
        Some(self.update_at(slot, row, ts, fill))
    }

    /// Update the row if present, otherwise insert it.
    ///
    /// Repeating an upsert without a newer timestamp is a no-op.
    pub fn upsert(&mut self, ts: Timestamp, key: MessageId) -> Applied {
        self.upsert_with(ts, key, |_| {})
    }

    /// Upsert, applying `fill` to the row before it is placed and published.
    pub fn upsert_with<F>(&mut self, ts: Timestamp, key: MessageId, fill: F) -> Applied
    where
        F: FnOnce(&mut Row),
    {
        if let Some((slot, row)) = self.take(&key) {
            return self.update_at(slot, row, ts, fill);
        }

        let mut row = Row::new(ts, key);
        fill(&mut row);
        self.insert_row(row)
    }

    /// Remove a row. Returns it if it was present.
    pub fn remove(&mut self, key: &MessageId) -> Option<Row> {
        self.take(key).map(|(_, row)| row)
    }

    /// Set the cached read flag of a row. Returns the previous flag, or
    /// `None` if the key is not indexed.
    pub fn set_read(&mut self, key: &MessageId, is_read: bool) -> Option<bool> {
        let slot = self.slots.get(key)?;
        let row = self.rows.get_mut(slot)?;
        let was = row.is_read;
        row.is_read = is_read;
        match (was, is_read) {
            (false, true) => self.unread -= 1,
            (true, false) => self.unread += 1,
            _ => {}
        }
        Some(was)
    }

    /// Detach a row from both maps, keeping the unread count in step.
    fn take(&mut self, key: &MessageId) -> Option<(Slot, Row)> {
        let slot = self.slots.remove(key)?;
        let row = self.rows.remove(&slot)?;
        if !row.is_read {
            self.unread -= 1;
        }
        Some((slot, row))
    }

    /// Put a taken row back, moving it only when `ts` is newer.
    fn update_at<F>(&mut self, slot: Slot, mut row: Row, ts: Timestamp, fill: F) -> Applied
    where
        F: FnOnce(&mut Row),
    {
        if row.ts >= ts {
            fill(&mut row);
            if !row.is_read {
                self.unread += 1;
            }
            self.slots.insert(row.key.clone(), slot);
            self.rows.insert(slot, row.clone());
            return Applied {
                outcome: Outcome::Unchanged,
                row,
                published: false,
            };
        }

        row.ts = ts;
        fill(&mut row);

        let mut applied = self.insert_row(row);
        applied.outcome = Outcome::Moved;
        applied
    }

    // --- Live listeners ---

    /// Attach a listener that receives every published row.
    pub fn attach(&mut self) -> (ListenerId, Receiver<Row>) {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        let (sender, receiver) = unbounded();
        self.listeners.push((id, sender));
        (id, receiver)
    }

    /// Detach a listener. Returns false if it was already gone.
    pub fn detach(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_recent(&self, ts: Timestamp) -> bool {
        Timestamp::now().distance(ts) < self.recency_window
    }

    fn publish_if_recent(&mut self, row: &Row) -> bool {
        if !self.is_recent(row.ts) {
            return false;
        }
        // receivers dropped without detaching are pruned here
        self.listeners
            .retain(|(_, sender)| sender.send(row.clone()).is_ok());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> MessageId {
        MessageId::from(s)
    }

    fn keys(index: &SortedIndex) -> Vec<&str> {
        index.iter().map(|r| r.key.as_str()).collect()
    }

    fn recent(offset_ms: i64) -> Timestamp {
        Timestamp(Timestamp::now().0 - 60_000 + offset_ms)
    }

    #[test]
    fn test_insert_keeps_descending_order() {
        let mut index = SortedIndex::new("inbox");
        index.insert(Timestamp(100), key("a"), Extra::new());
        index.insert(Timestamp(300), key("b"), Extra::new());
        index.insert(Timestamp(200), key("c"), Extra::new());

        assert_eq!(keys(&index), vec!["b", "c", "a"]);
        assert_eq!(index.index_of(&key("a")), Some(2));
        assert_eq!(index.index_of(&key("b")), Some(0));
        assert_eq!(index.index_of(&key("zz")), None);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut index = SortedIndex::new("inbox");
        index.insert(Timestamp(100), key("first"), Extra::new());
        index.insert(Timestamp(100), key("second"), Extra::new());

        assert_eq!(keys(&index), vec!["first", "second"]);
    }

    #[test]
    fn test_upsert_newer_moves_row() {
        let mut index = SortedIndex::new("inbox");
        index.upsert(Timestamp(100), key("a"));
        index.upsert(Timestamp(300), key("b"));
        index.upsert(Timestamp(200), key("c"));

        let applied = index.upsert(Timestamp(400), key("a"));
        assert_eq!(applied.outcome, Outcome::Moved);
        assert_eq!(keys(&index), vec!["a", "b", "c"]);
        assert_eq!(index.find(&key("a")).unwrap().ts, Timestamp(400));
    }

    #[test]
    fn test_upsert_older_is_noop() {
        let mut index = SortedIndex::new("inbox");
        index.upsert(Timestamp(300), key("a"));
        index.upsert(Timestamp(200), key("b"));

        let applied = index.upsert(Timestamp(100), key("a"));
        assert_eq!(applied.outcome, Outcome::Unchanged);
        assert_eq!(applied.row.ts, Timestamp(300));
        assert_eq!(keys(&index), vec!["a", "b"]);

        let again = index.upsert(Timestamp(300), key("a"));
        assert_eq!(again.outcome, Outcome::Unchanged);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_update_missing_key() {
        let mut index = SortedIndex::new("inbox");
        assert!(index.update(Timestamp(1), &key("nope")).is_none());
    }

    #[test]
    fn test_remove() {
        let mut index = SortedIndex::new("inbox");
        index.upsert(Timestamp(3), key("a"));
        index.upsert(Timestamp(2), key("b"));
        index.upsert(Timestamp(1), key("c"));

        let removed = index.remove(&key("b")).unwrap();
        assert_eq!(removed.key, key("b"));
        assert_eq!(keys(&index), vec!["a", "c"]);
        assert_eq!(index.index_of(&key("c")), Some(1));
        assert!(index.remove(&key("b")).is_none());
        assert_eq!(index.unread_count(), 2);
    }

    #[test]
    fn test_moved_row_goes_after_equal_timestamps() {
        let mut index = SortedIndex::new("inbox");
        index.upsert(Timestamp(5), key("a"));
        index.upsert(Timestamp(1), key("b"));
        index.upsert(Timestamp(5), key("b"));

        assert_eq!(keys(&index), vec!["a", "b"]);
    }

    #[test]
    fn test_ascending_replay_stays_fast() {
        // log order is usually oldest first, so every row lands on top
        let mut index = SortedIndex::new("inbox");
        let started = std::time::Instant::now();
        for i in 0..60_000i64 {
            index.upsert(Timestamp(i), MessageId::from(format!("%{}", i)));
        }
        assert!(started.elapsed() < Duration::from_secs(10));

        assert_eq!(index.len(), 60_000);
        assert_eq!(index.unread_count(), 60_000);
        assert_eq!(index.iter().next().unwrap().ts, Timestamp(59_999));
        assert_eq!(index.iter().last().unwrap().ts, Timestamp(0));
    }

    #[test]
    fn test_recent_insert_publishes() {
        let mut index = SortedIndex::new("inbox");
        let (_id, rx) = index.attach();

        let applied = index.insert(recent(0), key("fresh"), Extra::new());
        assert!(applied.published);
        assert_eq!(rx.try_recv().unwrap().key, key("fresh"));
    }

    #[test]
    fn test_old_insert_does_not_publish() {
        let mut index = SortedIndex::new("inbox");
        let (_id, rx) = index.attach();

        let three_days_ago = Timestamp::now().saturating_sub(Duration::from_secs(72 * 3600));
        let applied = index.insert(three_days_ago, key("old"), Extra::new());

        assert!(!applied.published);
        assert!(rx.try_recv().is_err());
        assert!(index.contains(&key("old")));
    }

    #[test]
    fn test_far_future_insert_does_not_publish() {
        let mut index = SortedIndex::new("inbox");
        let future = Timestamp::now().saturating_add(Duration::from_secs(72 * 3600));
        assert!(!index.insert(future, key("future"), Extra::new()).published);
    }

    #[test]
    fn test_move_republishes() {
        let mut index = SortedIndex::new("inbox");
        let first = recent(0);
        let later = Timestamp(first.0 + 10);
        index.upsert(first, key("a"));
        let (_id, rx) = index.attach();

        index.upsert(later, key("a"));
        assert_eq!(rx.try_recv().unwrap().ts, later);

        // unchanged upsert stays quiet
        index.upsert(later, key("a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_fill_applies_before_publish() {
        let mut index = SortedIndex::new("inbox");
        let (_id, rx) = index.attach();

        index.upsert_with(recent(0), key("a"), |row| row.is_read = true);
        assert!(rx.try_recv().unwrap().is_read);
        assert!(index.find(&key("a")).unwrap().is_read);
    }

    #[test]
    fn test_detach_and_dropped_listeners() {
        let mut index = SortedIndex::new("inbox");
        let (id, _rx) = index.attach();
        let (_other, rx2) = index.attach();
        assert_eq!(index.listener_count(), 2);

        assert!(index.detach(id));
        assert!(!index.detach(id));

        drop(rx2);
        index.insert(recent(0), key("x"), Extra::new());
        assert_eq!(index.listener_count(), 0);
    }

    #[test]
    fn test_touch_and_untouched() {
        let mut index = SortedIndex::new("inbox");
        let before = index.last_accessed();
        let previous = index.touch();
        assert_eq!(previous, before);
        assert!(index.last_accessed() >= before);

        let accessed = index.last_accessed();
        index.upsert(accessed.saturating_add(Duration::from_secs(10)), key("new"));
        index.upsert(accessed.saturating_sub(Duration::from_secs(10)), key("old"));
        assert_eq!(index.count_untouched(), 1);
    }

    #[test]
    fn test_read_flags() {
        let mut index = SortedIndex::new("inbox");
        index.upsert(Timestamp(2), key("a"));
        index.upsert(Timestamp(1), key("b"));

        assert_eq!(index.unread_count(), 2);
        assert_eq!(index.set_read(&key("a"), true), Some(false));
        assert_eq!(index.set_read(&key("a"), true), Some(true));
        assert_eq!(index.set_read(&key("zz"), true), None);
        assert_eq!(index.unread_count(), 1);
        assert_eq!(index.unread_keys(), vec![key("b")]);
    }

    #[test]
    fn test_row_serializes_flat() {
        let mut extra = Extra::new();
        extra.insert("author".into(), serde_json::json!("@bob"));
        let mut index = SortedIndex::new("notices");
        let applied = index.insert(Timestamp(7), key("n"), extra);

        let value = serde_json::to_value(&applied.row).unwrap();
        assert_eq!(value["key"], "n");
        assert_eq!(value["ts"], 7);
        assert_eq!(value["isread"], false);
        assert_eq!(value["author"], "@bob");
    }
}
