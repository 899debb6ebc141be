//! Materialized state checkpoints.
//!
//! A checkpoint is the full follower and followed set of an account as of a
//! given batch. Folding can start from the latest checkpoint at or before the
//! target position instead of from the first batch.

use crate::error::Result;
use crate::frames::FrameLog;
use crate::ids::IdSet;
use crate::types::{AccountId, BatchId, Sequence, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Full state of one account as of one batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub account: AccountId,
    pub batch: BatchId,
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    pub followers: IdSet,
    pub followed: IdSet,
}

/// Location of a checkpoint in the log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointMeta {
    pub batch: BatchId,
    pub sequence: Sequence,
    pub timestamp: Timestamp,
    pub offset: u64,
}

/// Persisted checkpoints, indexed by account and sequence.
pub struct CheckpointStore {
    log: FrameLog<Checkpoint>,
    index: RwLock<HashMap<AccountId, Vec<CheckpointMeta>>>,
}

impl CheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (log, entries) = FrameLog::<Checkpoint>::open(path)?;

        let mut index: HashMap<AccountId, Vec<CheckpointMeta>> = HashMap::new();
        for (offset, checkpoint) in entries {
            index
                .entry(checkpoint.account)
                .or_default()
                .push(CheckpointMeta {
                    batch: checkpoint.batch,
                    sequence: checkpoint.sequence,
                    timestamp: checkpoint.timestamp,
                    offset,
                });
        }
        // Later entries for the same sequence win.
        for metas in index.values_mut() {
            metas.reverse();
            metas.sort_by_key(|meta| meta.sequence);
            metas.dedup_by_key(|meta| meta.sequence);
        }

        Ok(Self {
            log,
            index: RwLock::new(index),
        })
    }

    pub fn write(&self, checkpoint: &Checkpoint) -> Result<()> {
        let offset = self.log.append(checkpoint)?;

        let mut index = self.index.write();
        let metas = index.entry(checkpoint.account).or_default();
        metas.retain(|meta| meta.sequence != checkpoint.sequence);
        metas.push(CheckpointMeta {
            batch: checkpoint.batch,
            sequence: checkpoint.sequence,
            timestamp: checkpoint.timestamp,
            offset,
        });
        metas.sort_by_key(|meta| meta.sequence);

        Ok(())
    }

    /// Checkpoints of an account at or before `sequence`, latest first.
    pub fn candidates(&self, account: AccountId, sequence: Sequence) -> Vec<CheckpointMeta> {
        self.index
            .read()
            .get(&account)
            .map(|metas| {
                metas
                    .iter()
                    .rev()
                    .filter(|meta| meta.sequence <= sequence)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn load(&self, meta: &CheckpointMeta) -> Result<Checkpoint> {
        self.log.read_at(meta.offset)
    }

    pub fn count(&self) -> usize {
        self.index.read().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checkpoint(account: u64, sequence: u64, followers: &[u64]) -> Checkpoint {
        Checkpoint {
            account: AccountId(account),
            batch: BatchId(sequence * 10),
            sequence: Sequence(sequence),
            timestamp: Timestamp(sequence as i64 * 100),
            followers: IdSet::from(followers),
            followed: IdSet::new(),
        }
    }

    #[test]
    fn test_candidates_latest_first() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path().join("checkpoints.log")).unwrap();

        store.write(&checkpoint(1, 4, &[1])).unwrap();
        store.write(&checkpoint(1, 8, &[1, 2])).unwrap();
        store.write(&checkpoint(2, 4, &[3])).unwrap();

        let found = store.candidates(AccountId(1), Sequence(10));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].sequence, Sequence(8));

        let found = store.candidates(AccountId(1), Sequence(7));
        assert_eq!(found.len(), 1);
        assert_eq!(store.load(&found[0]).unwrap(), checkpoint(1, 4, &[1]));

        assert!(store.candidates(AccountId(1), Sequence(3)).is_empty());
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn test_rewritten_checkpoint_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints.log");

        {
            let store = CheckpointStore::open(&path).unwrap();
            store.write(&checkpoint(1, 4, &[1])).unwrap();
            store.write(&checkpoint(1, 4, &[1, 2])).unwrap();
            assert_eq!(store.count(), 1);
        }

        let store = CheckpointStore::open(&path).unwrap();
        let found = store.candidates(AccountId(1), Sequence(4));
        assert_eq!(found.len(), 1);
        assert_eq!(store.load(&found[0]).unwrap().followers, IdSet::from([1, 2]));
    }

    #[test]
    fn test_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoints.log");

        {
            let store = CheckpointStore::open(&path).unwrap();
            store.write(&checkpoint(5, 2, &[10, 20, 30])).unwrap();
        }

        let store = CheckpointStore::open(&path).unwrap();
        let found = store.candidates(AccountId(5), Sequence(2));
        assert_eq!(found.len(), 1);
        assert_eq!(
            store.load(&found[0]).unwrap().followers,
            IdSet::from([10, 20, 30])
        );
    }
}
