//! Snapshot differencing.
//!
//! A capture is a complete membership set for one side of an account. The
//! engine turns two consecutive captures into the additions and removals that
//! get persisted in a batch. It never sees partial fetches: an empty `current`
//! really means the account has nobody on that side now.

use crate::ids::IdSet;
use serde::{Deserialize, Serialize};

/// Additions and removals for one side of one batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Present now, absent before.
    pub additions: IdSet,
    /// Present before, absent now.
    pub removals: IdSet,
}

impl Change {
    pub fn new(additions: IdSet, removals: IdSet) -> Self {
        Self {
            additions,
            removals,
        }
    }

    /// First capture of a side: everything is an addition.
    pub fn initial(current: IdSet) -> Self {
        Self {
            additions: current,
            removals: IdSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    /// Total number of IDs mentioned.
    pub fn len(&self) -> usize {
        self.additions.len() + self.removals.len()
    }

    /// An ID may not be both added and removed in the same change.
    pub fn is_consistent(&self) -> bool {
        self.additions.is_disjoint(&self.removals)
    }
}

/// Compute `current - previous` and `previous - current` in one merge pass.
pub fn diff(previous: &IdSet, current: &IdSet) -> Change {
    let (prev, curr) = (previous.as_slice(), current.as_slice());
    let mut additions = Vec::new();
    let mut removals = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < prev.len() && j < curr.len() {
        match prev[i].cmp(&curr[j]) {
            std::cmp::Ordering::Less => {
                removals.push(prev[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                additions.push(curr[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    removals.extend_from_slice(&prev[i..]);
    additions.extend_from_slice(&curr[j..]);

    Change {
        additions: IdSet::from_sorted(additions),
        removals: IdSet::from_sorted(removals),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_followers_shift() {
        let change = diff(&IdSet::from([1, 2, 3]), &IdSet::from([2, 3, 4]));
        assert_eq!(change.additions, IdSet::from([4]));
        assert_eq!(change.removals, IdSet::from([1]));
    }

    #[test]
    fn test_empty_previous() {
        let current = IdSet::from([7, 8]);
        let change = diff(&IdSet::new(), &current);
        assert_eq!(change, Change::initial(current));
    }

    #[test]
    fn test_empty_current() {
        let previous = IdSet::from([7, 8]);
        let change = diff(&previous, &IdSet::new());
        assert!(change.additions.is_empty());
        assert_eq!(change.removals, previous);
    }

    #[test]
    fn test_identical_sets() {
        let set = IdSet::from([1, 5, 9]);
        assert!(diff(&set, &set).is_empty());
    }

    #[test]
    fn test_consistency() {
        assert!(Change::new(IdSet::from([1]), IdSet::from([2])).is_consistent());
        assert!(!Change::new(IdSet::from([1, 2]), IdSet::from([2])).is_consistent());
    }
}
