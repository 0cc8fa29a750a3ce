//! Core types shared by the indexes, the pipeline and the query layer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identity of a message in the log.
///
/// Globally unique per message. Identities minted by this crate are
/// content-addressed (`%<sha256 hex>.sha256`), but any string supplied by a
/// log source is accepted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    /// Content-address a message.
    pub fn for_message(message: &Message) -> Result<Self, serde_json::Error> {
        let encoded = serde_json::to_vec(message)?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        let digest: [u8; 32] = hasher.finalize().into();
        Ok(MessageId(format!("%{}.sha256", hex::encode(digest))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        MessageId(s)
    }
}

/// Milliseconds since Unix epoch.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }

    /// Absolute distance between two timestamps.
    pub fn distance(self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.abs_diff(other.0))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_sub(d.as_millis() as i64))
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_millis() as i64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl From<i64> for Timestamp {
    fn from(ms: i64) -> Self {
        Timestamp(ms)
    }
}

/// A signed message as asserted by its author.
///
/// `timestamp` is the author's assertion time, used only for display
/// ordering. It can disagree with log arrival order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub author: String,
    pub timestamp: Timestamp,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: serde_json::Value,
}

impl Message {
    pub fn new(
        author: impl Into<String>,
        timestamp: Timestamp,
        kind: impl Into<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            author: author.into(),
            timestamp,
            kind: kind.into(),
            content,
        }
    }

    /// Text body, if the content carries one.
    pub fn text(&self) -> Option<&str> {
        self.content.get("text").and_then(|t| t.as_str())
    }
}

/// One entry of the append-only log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: MessageId,
    /// Position in arrival order.
    pub seq: u64,
    /// Local arrival time.
    pub received: Timestamp,
    pub value: Message,
}
