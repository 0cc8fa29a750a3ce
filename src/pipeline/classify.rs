//! Routing of log entries into indexes.

use crate::error::{IndexError, Result};
use crate::index::{Extra, INBOX, NOTICES};
use crate::log::LogSource;
use crate::types::{LogEntry, MessageId, Timestamp};
use serde_json::{json, Value};
use std::sync::Arc;

/// Where an entry lands in one index.
#[derive(Clone, Debug, PartialEq)]
pub struct Placement {
    pub index: String,
    pub key: MessageId,
    pub ts: Timestamp,
    /// Extra fields copied onto the row.
    pub extra: Extra,
    /// Read flag decided by the classifier, e.g. a reply that makes its
    /// thread unread again. `None` defers to the read-state store.
    pub is_read: Option<bool>,
}

impl Placement {
    pub fn new(index: impl Into<String>, key: MessageId, ts: Timestamp) -> Self {
        Self {
            index: index.into(),
            key,
            ts,
            extra: Extra::new(),
            is_read: None,
        }
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    pub fn with_read(mut self, is_read: bool) -> Self {
        self.is_read = Some(is_read);
        self
    }
}

/// An application event to forward to bus subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct DomainEvent {
    pub kind: String,
    pub data: Value,
}

/// The classification result for one log entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Routing {
    pub placements: Vec<Placement>,
    pub events: Vec<DomainEvent>,
}

impl Routing {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn place(mut self, placement: Placement) -> Self {
        self.placements.push(placement);
        self
    }

    pub fn emit(mut self, kind: impl Into<String>, data: Value) -> Self {
        self.events.push(DomainEvent {
            kind: kind.into(),
            data,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty() && self.events.is_empty()
    }
}

/// Decides which indexes a log entry belongs to.
///
/// Runs on the ingestion thread, once per entry, in log arrival order. It
/// may block on lookups; the entry counts as in-flight work until it
/// returns.
pub trait Classifier: Send + Sync {
    fn classify(&self, entry: &LogEntry) -> Result<Routing>;
}

impl<F> Classifier for F
where
    F: Fn(&LogEntry) -> Result<Routing> + Send + Sync,
{
    fn classify(&self, entry: &LogEntry) -> Result<Routing> {
        self(entry)
    }
}

/// Classifier for a single local identity.
///
/// - Messages from others that address or mention the identity, or reply
///   to one of its messages, go to `inbox`.
/// - Positive votes on the identity's messages and new follows of the
///   identity go to `notices` and raise a `notice` event.
///
/// The identity's own messages are never indexed.
pub struct RuleClassifier {
    me: String,
    log: Arc<dyn LogSource>,
}

impl RuleClassifier {
    pub fn new(me: impl Into<String>, log: Arc<dyn LogSource>) -> Self {
        Self {
            me: me.into(),
            log,
        }
    }

    /// Whether `target` is a message authored by the local identity.
    fn authored_by_me(&self, entry: &LogEntry, target: &str) -> Result<bool> {
        let message = self
            .log
            .get(&MessageId::from(target))
            .map_err(|e| IndexError::Classification {
                key: entry.key.clone(),
                reason: e.to_string(),
            })?;
        Ok(message.map_or(false, |m| m.author == self.me))
    }

    fn notice(&self, entry: &LogEntry, target: Option<&str>) -> Routing {
        let value = &entry.value;
        let placement = Placement::new(NOTICES, entry.key.clone(), value.timestamp)
            .with_extra("author", json!(value.author))
            .with_extra("kind", json!(value.kind));
        Routing::none().place(placement).emit(
            "notice",
            json!({
                "key": entry.key,
                "author": value.author,
                "kind": value.kind,
                "target": target,
            }),
        )
    }
}

impl Classifier for RuleClassifier {
    fn classify(&self, entry: &LogEntry) -> Result<Routing> {
        let value = &entry.value;
        if value.author == self.me {
            return Ok(Routing::none());
        }
        let content = &value.content;

        match value.kind.as_str() {
            "vote" => {
                let vote = content.get("vote");
                let positive = vote
                    .and_then(|v| v.get("value"))
                    .and_then(Value::as_i64)
                    .map_or(false, |v| v > 0);
                let target = match vote.and_then(|v| v.get("link")).and_then(link_of) {
                    Some(target) if positive => target,
                    _ => return Ok(Routing::none()),
                };
                if self.authored_by_me(entry, target)? {
                    Ok(self.notice(entry, Some(target)))
                } else {
                    Ok(Routing::none())
                }
            }
            "contact" => {
                let follows_me = content.get("contact").and_then(link_of) == Some(self.me.as_str())
                    && content.get("following").and_then(Value::as_bool) == Some(true);
                if follows_me {
                    Ok(self.notice(entry, None))
                } else {
                    Ok(Routing::none())
                }
            }
            _ => {
                let addressed = ["recps", "mentions"]
                    .iter()
                    .filter_map(|field| content.get(*field))
                    .flat_map(links)
                    .any(|link| link == self.me);

                let replies_to_me = match content.get("root").and_then(link_of) {
                    Some(root) => self.authored_by_me(entry, root)?,
                    None => false,
                };

                if addressed || replies_to_me {
                    let placement = Placement::new(INBOX, entry.key.clone(), value.timestamp)
                        .with_extra("author", json!(value.author));
                    Ok(Routing::none().place(placement))
                } else {
                    Ok(Routing::none())
                }
            }
        }
    }
}

/// A link is either a bare string or an object with a `link` field.
fn link_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("link").and_then(Value::as_str),
        _ => None,
    }
}

/// Every link in a single link or an array of links.
fn links(value: &Value) -> Vec<&str> {
    match value {
        Value::Array(items) => items.iter().filter_map(link_of).collect(),
        other => link_of(other).into_iter().collect(),
    }
}
