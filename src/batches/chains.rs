//! Per-account chain index.
//!
//! Rebuilt from the batch log on open. Each account's chain is a vector of
//! batch IDs in sequence order, so `next_id` of the batch at sequence `n` is
//! simply the entry at position `n`. Forward links therefore cannot branch
//! or be claimed twice.

use crate::error::{Result, StoreError};
use crate::types::{AccountId, BatchId, Sequence, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Where and when a batch lives, without its ID sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchMeta {
    pub id: BatchId,
    pub account: AccountId,
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    /// Offset of the record in the batch log.
    pub offset: u64,
}

#[derive(Default)]
struct Tables {
    by_id: HashMap<BatchId, BatchMeta>,
    chains: HashMap<AccountId, Vec<BatchId>>,
}

impl Tables {
    fn meta_at(&self, account: AccountId, index: usize) -> Option<BatchMeta> {
        self.chains
            .get(&account)
            .and_then(|chain| chain.get(index))
            .and_then(|id| self.by_id.get(id))
            .copied()
    }
}

/// Index of every account's batch chain.
#[derive(Default)]
pub struct ChainIndex {
    tables: RwLock<Tables>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend an account's chain.
    ///
    /// The batch must carry the next sequence number and a later timestamp
    /// than the current head.
    pub fn insert(&self, meta: BatchMeta) -> Result<()> {
        let mut tables = self.tables.write();

        if tables.by_id.contains_key(&meta.id) {
            return Err(StoreError::Corruption(format!(
                "Batch {} indexed twice",
                meta.id
            )));
        }

        let head = tables
            .chains
            .get(&meta.account)
            .and_then(|chain| chain.last())
            .and_then(|id| tables.by_id.get(id))
            .copied();

        let expected_sequence = head.map_or(Sequence::FIRST, |head| head.sequence.next());
        if meta.sequence != expected_sequence {
            return Err(StoreError::Corruption(format!(
                "Batch {} for account {} has {:?}, expected {:?}",
                meta.id, meta.account, meta.sequence, expected_sequence
            )));
        }

        if let Some(head) = head {
            if meta.timestamp <= head.timestamp {
                return Err(StoreError::Corruption(format!(
                    "Batch {} for account {} is not after batch {}",
                    meta.id, meta.account, head.id
                )));
            }
        }

        tables.by_id.insert(meta.id, meta);
        tables.chains.entry(meta.account).or_default().push(meta.id);

        Ok(())
    }

    pub fn get(&self, id: BatchId) -> Option<BatchMeta> {
        self.tables.read().by_id.get(&id).copied()
    }

    /// Latest batch of an account.
    pub fn head(&self, account: AccountId) -> Option<BatchMeta> {
        let tables = self.tables.read();
        let len = tables.chains.get(&account).map_or(0, Vec::len);
        len.checked_sub(1)
            .and_then(|index| tables.meta_at(account, index))
    }

    /// Earliest batch of an account.
    pub fn first(&self, account: AccountId) -> Option<BatchMeta> {
        self.tables.read().meta_at(account, 0)
    }

    /// The batch at a given position of an account's chain.
    pub fn at_sequence(&self, account: AccountId, sequence: Sequence) -> Option<BatchMeta> {
        let index = (sequence.0 as usize).checked_sub(1)?;
        self.tables.read().meta_at(account, index)
    }

    /// The batch immediately following `id` in its chain.
    pub fn next_of(&self, id: BatchId) -> Option<BatchId> {
        let tables = self.tables.read();
        let meta = tables.by_id.get(&id)?;
        tables
            .chains
            .get(&meta.account)
            .and_then(|chain| chain.get(meta.sequence.0 as usize))
            .copied()
    }

    /// An account's chain in order.
    pub fn chain(&self, account: AccountId) -> Vec<BatchMeta> {
        let tables = self.tables.read();
        tables
            .chains
            .get(&account)
            .map(|chain| {
                chain
                    .iter()
                    .filter_map(|id| tables.by_id.get(id).copied())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of batches in an account's chain.
    pub fn len(&self, account: AccountId) -> usize {
        self.tables
            .read()
            .chains
            .get(&account)
            .map_or(0, Vec::len)
    }

    /// Latest batch of an account captured at or before `at`.
    pub fn at_or_before(&self, account: AccountId, at: Timestamp) -> Option<BatchMeta> {
        let tables = self.tables.read();
        let chain = tables.chains.get(&account)?;

        // Timestamps strictly increase along a chain.
        let count = chain.partition_point(|id| {
            tables
                .by_id
                .get(id)
                .map_or(false, |meta| meta.timestamp <= at)
        });

        count
            .checked_sub(1)
            .and_then(|index| tables.meta_at(account, index))
    }

    /// All accounts with at least one batch, ascending.
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<_> = self.tables.read().chains.keys().copied().collect();
        accounts.sort_unstable();
        accounts
    }

    /// Total number of batches.
    pub fn count(&self) -> usize {
        self.tables.read().by_id.len()
    }
}
