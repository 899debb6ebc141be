//! Error types for the follow ledger.

use crate::types::{AccountId, BatchId, Timestamp};
use thiserror::Error;

/// Main error type for store and capture operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The collector could not produce a complete membership set.
    #[error("Fetch incomplete for account {account} at {timestamp}: {reason}")]
    FetchIncomplete {
        account: AccountId,
        timestamp: Timestamp,
        reason: String,
    },

    /// Capture timestamp is not strictly after the head of the chain.
    #[error("Out-of-order capture for account {account}: attempted {attempted}, latest is {latest}")]
    OutOfOrderCapture {
        account: AccountId,
        attempted: Timestamp,
        latest: Timestamp,
    },

    /// Another writer extended the chain first.
    #[error("Chain conflict for account {account} at {timestamp}: expected head {expected:?}, found {actual:?}")]
    ChainConflict {
        account: AccountId,
        timestamp: Timestamp,
        expected: Option<BatchId>,
        actual: Option<BatchId>,
    },

    /// Persistence failed in the middle of a capture cycle.
    #[error("Storage unavailable for account {account} at {timestamp}: {source}")]
    StorageUnavailable {
        account: AccountId,
        timestamp: Timestamp,
        #[source]
        source: std::io::Error,
    },

    /// A batch whose changes cannot apply to any state.
    #[error("Invalid diff for account {account} at {timestamp}: {reason}")]
    InvalidDiff {
        account: AccountId,
        timestamp: Timestamp,
        reason: String,
    },

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),
}

impl StoreError {
    /// Whether the caller may simply retry the whole cycle later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::FetchIncomplete { .. }
                | StoreError::StorageUnavailable { .. }
                | StoreError::Io(_)
        )
    }

    /// Whether the failure should be surfaced to an operator instead of retried.
    pub fn needs_operator(&self) -> bool {
        !self.is_transient()
    }

    /// The tracked account a capture failure refers to, if any.
    pub fn account(&self) -> Option<AccountId> {
        match self {
            StoreError::FetchIncomplete { account, .. }
            | StoreError::OutOfOrderCapture { account, .. }
            | StoreError::ChainConflict { account, .. }
            | StoreError::StorageUnavailable { account, .. }
            | StoreError::InvalidDiff { account, .. } => Some(*account),
            _ => None,
        }
    }

    /// Attach cycle context to a bare I/O failure.
    pub(crate) fn in_cycle(self, account: AccountId, timestamp: Timestamp) -> Self {
        match self {
            StoreError::Io(source) => StoreError::StorageUnavailable {
                account,
                timestamp,
                source,
            },
            other => other,
        }
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
