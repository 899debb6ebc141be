//! Reverse lookup: which batches mention an ID.
//!
//! The index maps every ID that ever appeared in a batch to the batches and
//! roles it appeared under. It is saved on sync together with a watermark
//! (the highest batch it covers); on open, batches past the watermark are
//! replayed from the log, so the saved copy may lag but is never required.

mod index;

pub use index::{MentionIndex, Posting};

use crate::types::{AccountId, BatchId, Role, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A batch that mentions an ID, with the role the ID plays in it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub batch: BatchId,
    pub account: AccountId,
    pub timestamp: Timestamp,
    pub role: Role,
}

/// Restartable cursor over mentions, ordered by capture time.
///
/// Cloning is cheap; clones share the underlying results.
#[derive(Clone, Debug)]
pub struct Mentions {
    entries: Arc<[Mention]>,
    position: usize,
}

impl Mentions {
    pub(crate) fn new(mut entries: Vec<Mention>) -> Self {
        entries.sort_by_key(|m| (m.timestamp, m.batch, m.role));
        Self {
            entries: entries.into(),
            position: 0,
        }
    }

    /// Start over from the first mention.
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Number of mentions, regardless of cursor position.
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[Mention] {
        &self.entries
    }

    /// Distinct batches, in capture order.
    pub fn batch_ids(&self) -> Vec<BatchId> {
        // Mentions of one batch are adjacent after sorting.
        let mut ids: Vec<_> = self.entries.iter().map(|m| m.batch).collect();
        ids.dedup();
        ids
    }

    /// Distinct tracked accounts, ascending.
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<_> = self.entries.iter().map(|m| m.account).collect();
        accounts.sort_unstable();
        accounts.dedup();
        accounts
    }
}

impl Iterator for Mentions {
    type Item = Mention;

    fn next(&mut self) -> Option<Mention> {
        let mention = self.entries.get(self.position).copied()?;
        self.position += 1;
        Some(mention)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.entries.len() - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Mentions {}
