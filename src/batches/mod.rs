//! Batch persistence.
//!
//! Batches are stored in an append-only log; an in-memory chain index maps
//! each account to its batches in sequence order for O(1) head lookup and
//! forward/backward traversal.

mod chains;
mod log;

pub use chains::{BatchMeta, ChainIndex};
pub use log::{BatchHeader, BatchLog, ScannedRecord};
