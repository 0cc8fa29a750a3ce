//! Error types for the indexer.

use crate::types::MessageId;
use thiserror::Error;

/// Main error type for indexer operations.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid index: {0}")]
    UnknownIndex(String),

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Read-state store error: {0}")]
    ReadState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid journal format: {0}")]
    InvalidFormat(String),

    #[error("Journal is locked by another process")]
    Locked,

    #[error("Classification failed for {key}: {reason}")]
    Classification { key: MessageId, reason: String },

    #[error("Fetch failed for {key}: {reason}")]
    Fetch { key: MessageId, reason: String },

    #[error("Ingestion thread panicked")]
    IngestPanicked,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for IndexError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        IndexError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for IndexError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        IndexError::Deserialization(e.to_string())
    }
}

/// Result type for indexer operations.
pub type Result<T> = std::result::Result<T, IndexError>;
