//! Materialized follower and followed sets.

use crate::checkpoints::Checkpoint;
use crate::error::{Result, StoreError};
use crate::ids::{IdSet, MembershipConflict};
use crate::types::{AccountId, Batch, BatchId, Sequence, Side, Timestamp};

/// The batch a materialized state was folded up to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainHead {
    pub batch: BatchId,
    pub sequence: Sequence,
    pub timestamp: Timestamp,
}

/// Full membership of one account as of its head batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Materialized {
    pub account: AccountId,
    pub followers: IdSet,
    pub followed: IdSet,
    /// `None` until the first batch is applied.
    pub head: Option<ChainHead>,
}

impl Materialized {
    pub fn empty(account: AccountId) -> Self {
        Self {
            account,
            followers: IdSet::new(),
            followed: IdSet::new(),
            head: None,
        }
    }

    pub fn from_checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            account: checkpoint.account,
            followers: checkpoint.followers,
            followed: checkpoint.followed,
            head: Some(ChainHead {
                batch: checkpoint.batch,
                sequence: checkpoint.sequence,
                timestamp: checkpoint.timestamp,
            }),
        }
    }

    pub fn to_checkpoint(&self) -> Option<Checkpoint> {
        self.head.map(|head| Checkpoint {
            account: self.account,
            batch: head.batch,
            sequence: head.sequence,
            timestamp: head.timestamp,
            followers: self.followers.clone(),
            followed: self.followed.clone(),
        })
    }

    pub fn side(&self, side: Side) -> &IdSet {
        match side {
            Side::Follower => &self.followers,
            Side::Followed => &self.followed,
        }
    }

    /// Sequence of the head batch, 0 for an empty state.
    pub fn sequence(&self) -> Sequence {
        self.head.map_or(Sequence(0), |head| head.sequence)
    }

    /// Apply the next batch of the chain.
    ///
    /// Fails with `Corruption` if the batch does not directly follow the
    /// head, adds an ID that is already present, or removes one that is not.
    /// The state is left untouched on failure.
    pub fn apply(&mut self, batch: &Batch) -> Result<()> {
        if batch.account != self.account {
            return Err(StoreError::Corruption(format!(
                "Batch {} of account {} applied to account {}",
                batch.id, batch.account, self.account
            )));
        }
        if batch.sequence != self.sequence().next() {
            return Err(StoreError::Corruption(format!(
                "Batch {} of account {} has {:?}, expected {:?}",
                batch.id,
                self.account,
                batch.sequence,
                self.sequence().next()
            )));
        }

        let followers = self.fold_side(batch, Side::Follower)?;
        let followed = self.fold_side(batch, Side::Followed)?;

        self.followers = followers;
        self.followed = followed;
        self.head = Some(ChainHead {
            batch: batch.id,
            sequence: batch.sequence,
            timestamp: batch.timestamp,
        });

        Ok(())
    }

    fn fold_side(&self, batch: &Batch, side: Side) -> Result<IdSet> {
        let change = batch.change(side);
        self.side(side)
            .apply(&change.additions, &change.removals)
            .map_err(|conflict| {
                let (id, problem) = match conflict {
                    MembershipConflict::AlreadyPresent(id) => (id, "adds already present"),
                    MembershipConflict::NotPresent(id) => (id, "removes absent"),
                };
                StoreError::Corruption(format!(
                    "Batch {} of account {} {} {:?} ID {}",
                    batch.id, self.account, problem, side, id
                ))
            })
    }
}

/// Fold a run of consecutive batches onto a starting state.
pub fn fold<I>(start: Materialized, batches: I) -> Result<Materialized>
where
    I: IntoIterator<Item = Result<Batch>>,
{
    let mut state = start;
    for batch in batches {
        state.apply(&batch?)?;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::Change;

    fn batch(id: u64, sequence: u64, follower_change: Change) -> Batch {
        Batch {
            id: BatchId(id),
            account: AccountId(1),
            sequence: Sequence(sequence),
            timestamp: Timestamp(sequence as i64 * 10),
            next_id: None,
            follower_change,
            followed_change: Change::default(),
        }
    }

    #[test]
    fn test_fold_scenario() {
        let batches = vec![
            Ok(batch(1, 1, Change::initial(IdSet::from([1, 2, 3])))),
            Ok(batch(2, 2, Change::new(IdSet::from([4]), IdSet::from([1])))),
        ];

        let state = fold(Materialized::empty(AccountId(1)), batches).unwrap();
        assert_eq!(state.followers, IdSet::from([2, 3, 4]));
        assert!(state.followed.is_empty());
        assert_eq!(state.head.unwrap().batch, BatchId(2));
        assert_eq!(state.sequence(), Sequence(2));
    }

    #[test]
    fn test_duplicate_addition_is_corruption() {
        let mut state = Materialized::empty(AccountId(1));
        state
            .apply(&batch(1, 1, Change::initial(IdSet::from([1, 2]))))
            .unwrap();

        let bad = batch(2, 2, Change::new(IdSet::from([2]), IdSet::new()));
        let err = state.apply(&bad).unwrap_err();
        match err {
            StoreError::Corruption(message) => {
                assert!(message.contains("account 1"));
                assert!(message.contains("ID 2"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // Untouched after the failure.
        assert_eq!(state.followers, IdSet::from([1, 2]));
        assert_eq!(state.sequence(), Sequence::FIRST);
    }

    #[test]
    fn test_missing_removal_is_corruption() {
        let mut state = Materialized::empty(AccountId(1));
        state.apply(&batch(1, 1, Change::initial(IdSet::from([1])))).unwrap();

        let bad = batch(2, 2, Change::new(IdSet::new(), IdSet::from([9])));
        assert!(matches!(state.apply(&bad), Err(StoreError::Corruption(_))));
    }

    #[test]
    fn test_gap_is_corruption() {
        let mut state = Materialized::empty(AccountId(1));
        let skipped = batch(3, 2, Change::initial(IdSet::from([1])));
        assert!(matches!(state.apply(&skipped), Err(StoreError::Corruption(_))));
        assert!(state.head.is_none());
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut state = Materialized::empty(AccountId(1));
        assert!(state.to_checkpoint().is_none());

        state.apply(&batch(1, 1, Change::initial(IdSet::from([5])))).unwrap();
        let checkpoint = state.to_checkpoint().unwrap();
        assert_eq!(Materialized::from_checkpoint(checkpoint), state);
    }
}
