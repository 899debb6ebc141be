//! Core types for the follow ledger.

use crate::diff::Change;
use crate::ids::IdSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A social-network account identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub u64);

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({})", self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique, monotonically increasing batch identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl fmt::Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchId({})", self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1-based position of a batch in its account's chain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub const FIRST: Sequence = Sequence(1);

    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

/// Seconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time, truncated to whole seconds.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        Timestamp(secs)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which membership list of a tracked account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Accounts following the tracked account.
    Follower,
    /// Accounts the tracked account follows.
    Followed,
}

/// Which of the four diff sets an ID appears in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    FollowerAddition,
    FollowerRemoval,
    FollowedAddition,
    FollowedRemoval,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::FollowerAddition,
        Role::FollowerRemoval,
        Role::FollowedAddition,
        Role::FollowedRemoval,
    ];

    pub fn side(self) -> Side {
        match self {
            Role::FollowerAddition | Role::FollowerRemoval => Side::Follower,
            Role::FollowedAddition | Role::FollowedRemoval => Side::Followed,
        }
    }

    pub fn is_addition(self) -> bool {
        matches!(self, Role::FollowerAddition | Role::FollowedAddition)
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Role::FollowerAddition => 0,
            Role::FollowerRemoval => 1,
            Role::FollowedAddition => 2,
            Role::FollowedRemoval => 3,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        Role::ALL.get(byte as usize).copied()
    }
}

/// One persisted capture event for a tracked account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Unique identifier (assigned by store).
    pub id: BatchId,

    /// Tracked account that owns this batch.
    pub account: AccountId,

    /// Position in the account's chain (assigned by store).
    pub sequence: Sequence,

    /// Capture time.
    pub timestamp: Timestamp,

    /// The batch that follows this one in the same chain, if any yet.
    pub next_id: Option<BatchId>,

    pub follower_change: Change,

    pub followed_change: Change,
}

impl Batch {
    pub fn change(&self, side: Side) -> &Change {
        match side {
            Side::Follower => &self.follower_change,
            Side::Followed => &self.followed_change,
        }
    }

    /// The diff set for a role.
    pub fn ids(&self, role: Role) -> &IdSet {
        let change = self.change(role.side());
        if role.is_addition() {
            &change.additions
        } else {
            &change.removals
        }
    }

    pub fn is_initial(&self) -> bool {
        self.sequence == Sequence::FIRST
    }
}

/// Input for appending a batch (before id/sequence are assigned).
#[derive(Clone, Debug)]
pub struct BatchInput {
    pub account: AccountId,
    pub timestamp: Timestamp,
    /// The chain head the changes were computed against (`None` for a first capture).
    pub parent: Option<BatchId>,
    pub follower_change: Change,
    pub followed_change: Change,
}

impl BatchInput {
    /// Input for the very first capture of an account.
    pub fn initial(account: AccountId, timestamp: Timestamp, followers: IdSet, followed: IdSet) -> Self {
        Self {
            account,
            timestamp,
            parent: None,
            follower_change: Change::initial(followers),
            followed_change: Change::initial(followed),
        }
    }
}

/// Tracked account metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAccount {
    pub id: AccountId,
    /// Last-known display name, not versioned.
    pub screen_name: Option<String>,
    pub first_capture: Option<Timestamp>,
    pub last_capture: Option<Timestamp>,
    pub batch_count: u64,
}

/// Lifecycle of an account's chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    /// No batch yet.
    Uninitialized,
    /// Exactly one batch (the full initial snapshot).
    Initialized,
    /// At least one diff batch after the initial one.
    Updated,
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub batch_count: u64,
    pub account_count: u64,
    pub mentioned_id_count: u64,
    pub checkpoint_count: u64,
    pub log_size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_navigation() {
        let seq = Sequence(5);
        assert_eq!(seq.next(), Sequence(6));
    }

    #[test]
    fn test_role_roundtrip() {
        for role in Role::ALL {
            assert_eq!(Role::from_byte(role.to_byte()), Some(role));
        }
        assert_eq!(Role::from_byte(4), None);
    }
}
