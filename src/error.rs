//! Error types for the storage engine.

use thiserror::Error;
use crate::types::NodeId;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Referenced node does not exist (freed, or never allocated)
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    /// Allocator has exhausted its usable address space
    #[error("allocator exhausted: cannot allocate a new node")]
    AllocatorExhausted,

    /// Caller passed a key of the wrong fixed size for this tree
    #[error("key size mismatch: expected {expected} bytes, got {actual}")]
    KeySizeMismatch { expected: usize, actual: usize },

    /// Caller passed a value of the wrong fixed size for this tree
    #[error("value size mismatch: expected {expected} bytes, got {actual}")]
    ValueSizeMismatch { expected: usize, actual: usize },

    /// Data corruption detected (e.g., checksum mismatch, bad magic)
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Node bytes don't decode into a sane layout (out-of-range num_keys, etc.)
    #[error("invalid node layout: {0}")]
    InvalidNodeLayout(String),

    /// Invalid operation for the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Key not found (for operations that require an existing key)
    #[error("key not found")]
    KeyNotFound,

    /// Database file is corrupted or has an invalid format
    #[error("invalid database file: {0}")]
    InvalidDatabaseFile(String),
}

impl StorageError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    pub fn invalid_node_layout(msg: impl Into<String>) -> Self {
        Self::InvalidNodeLayout(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn invalid_db(msg: impl Into<String>) -> Self {
        Self::InvalidDatabaseFile(msg.into())
    }
}
