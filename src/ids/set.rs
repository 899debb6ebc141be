//! Immutable, ascending set of account IDs.

use super::codec;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;

/// Number of IDs shown by the `Debug` impl before eliding.
const DEBUG_PREVIEW: usize = 8;

/// A deduplicated set of 64-bit account IDs, iterated in ascending order.
///
/// Backed by a sorted vector: membership is a binary search, and every set
/// operation below is a single linear merge of two sorted inputs.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct IdSet(Vec<u64>);

/// Reason a change could not be applied to a set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipConflict {
    /// An addition names an ID that is already a member.
    AlreadyPresent(u64),
    /// A removal names an ID that is not a member.
    NotPresent(u64),
}

impl IdSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build from arbitrary input, sorting and dropping duplicates.
    pub fn from_unsorted(mut ids: Vec<u64>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }

    /// Build from a vector already known to be strictly ascending.
    pub(crate) fn from_sorted(ids: Vec<u64>) -> Self {
        debug_assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        Self(ids)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::iter::Copied<std::slice::Iter<'_, u64>> {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u64> {
        self.0
    }

    /// IDs in `self` that are not in `other`.
    pub fn difference(&self, other: &IdSet) -> IdSet {
        let (mut i, mut j) = (0, 0);
        let (a, b) = (&self.0, &other.0);
        let mut out = Vec::new();

        while i < a.len() {
            if j >= b.len() || a[i] < b[j] {
                out.push(a[i]);
                i += 1;
            } else if a[i] > b[j] {
                j += 1;
            } else {
                i += 1;
                j += 1;
            }
        }

        IdSet(out)
    }

    pub fn is_disjoint(&self, other: &IdSet) -> bool {
        let (mut i, mut j) = (0, 0);
        let (a, b) = (&self.0, &other.0);

        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => return false,
            }
        }

        true
    }

    /// Remove `removals` and insert `additions`, requiring that every removal
    /// is a member and no addition is.
    pub fn apply(
        &self,
        additions: &IdSet,
        removals: &IdSet,
    ) -> std::result::Result<IdSet, MembershipConflict> {
        // Pass 1: self - removals, every removal must hit.
        let mut kept = Vec::with_capacity(self.len().saturating_sub(removals.len()));
        let (mut i, mut j) = (0, 0);
        let (a, r) = (&self.0, &removals.0);

        while j < r.len() {
            if i >= a.len() || a[i] > r[j] {
                return Err(MembershipConflict::NotPresent(r[j]));
            } else if a[i] < r[j] {
                kept.push(a[i]);
                i += 1;
            } else {
                i += 1;
                j += 1;
            }
        }
        kept.extend_from_slice(&a[i..]);

        // Pass 2: kept + additions, no addition may already be present.
        let mut out = Vec::with_capacity(kept.len() + additions.len());
        let (mut i, mut j) = (0, 0);
        let add = &additions.0;

        while i < kept.len() && j < add.len() {
            match kept[i].cmp(&add[j]) {
                std::cmp::Ordering::Less => {
                    out.push(kept[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    out.push(add[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    return Err(MembershipConflict::AlreadyPresent(add[j]));
                }
            }
        }
        out.extend_from_slice(&kept[i..]);
        out.extend_from_slice(&add[j..]);

        Ok(IdSet(out))
    }
}

impl fmt::Debug for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= DEBUG_PREVIEW {
            write!(f, "IdSet({:?})", self.0)
        } else {
            write!(
                f,
                "IdSet({:?}.. {} total)",
                &self.0[..DEBUG_PREVIEW],
                self.0.len()
            )
        }
    }
}

impl FromIterator<u64> for IdSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self::from_unsorted(iter.into_iter().collect())
    }
}

impl From<Vec<u64>> for IdSet {
    fn from(ids: Vec<u64>) -> Self {
        Self::from_unsorted(ids)
    }
}

impl From<&[u64]> for IdSet {
    fn from(ids: &[u64]) -> Self {
        Self::from_unsorted(ids.to_vec())
    }
}

impl<const N: usize> From<[u64; N]> for IdSet {
    fn from(ids: [u64; N]) -> Self {
        Self::from_unsorted(ids.to_vec())
    }
}

impl From<HashSet<u64>> for IdSet {
    fn from(ids: HashSet<u64>) -> Self {
        Self::from_unsorted(ids.into_iter().collect())
    }
}

impl IntoIterator for IdSet {
    type Item = u64;
    type IntoIter = std::vec::IntoIter<u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a IdSet {
    type Item = u64;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, u64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Serialized as a byte string of delta-varints.
impl Serialize for IdSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&codec::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for IdSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_bytes(IdSetVisitor)
    }
}

struct IdSetVisitor;

impl IdSetVisitor {
    fn decode<E: de::Error>(bytes: &[u8]) -> std::result::Result<IdSet, E> {
        // Count values first: every varint ends on a byte without the high bit.
        let count = bytes.iter().filter(|byte| **byte & 0x80 == 0).count();
        codec::decode(bytes, count)
            .map(IdSet::from_sorted)
            .map_err(|e| E::custom(e.to_string()))
    }
}

impl<'de> Visitor<'de> for IdSetVisitor {
    type Value = IdSet;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("delta-varint encoded ID bytes")
    }

    fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> std::result::Result<IdSet, E> {
        Self::decode(bytes)
    }

    // Self-describing formats without a bytes type hand us a sequence of u8.
    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<IdSet, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Self::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_dedups_and_sorts() {
        let set = IdSet::from(vec![5, 3, 5, 1, 3]);
        assert_eq!(set.as_slice(), &[1, 3, 5]);
        assert_eq!(set.len(), 3);
        assert!(set.contains(3));
        assert!(!set.contains(4));
    }

    #[test]
    fn test_from_hash_set_is_deterministic() {
        let hashed: HashSet<u64> = [9, 2, 7, 4].into_iter().collect();
        assert_eq!(IdSet::from(hashed).into_vec(), vec![2, 4, 7, 9]);
    }

    #[test]
    fn test_difference_and_disjoint() {
        let a = IdSet::from([1, 2, 3, 4]);
        let b = IdSet::from([2, 4, 6]);
        assert_eq!(a.difference(&b), IdSet::from([1, 3]));
        assert_eq!(b.difference(&a), IdSet::from([6]));
        assert!(!a.is_disjoint(&b));
        assert!(IdSet::from([1, 3]).is_disjoint(&IdSet::from([2, 4])));
        assert!(IdSet::new().is_disjoint(&a));
    }

    #[test]
    fn test_apply() {
        let set = IdSet::from([1, 2, 3]);
        let next = set
            .apply(&IdSet::from([4, 0]), &IdSet::from([1]))
            .unwrap();
        assert_eq!(next.as_slice(), &[0, 2, 3, 4]);
    }

    #[test]
    fn test_apply_conflicts() {
        let set = IdSet::from([1, 2, 3]);
        assert_eq!(
            set.apply(&IdSet::from([2]), &IdSet::new()),
            Err(MembershipConflict::AlreadyPresent(2))
        );
        assert_eq!(
            set.apply(&IdSet::new(), &IdSet::from([9])),
            Err(MembershipConflict::NotPresent(9))
        );
        assert_eq!(
            IdSet::new().apply(&IdSet::new(), &IdSet::from([1])),
            Err(MembershipConflict::NotPresent(1))
        );
    }

    #[test]
    fn test_debug_is_truncated() {
        let set: IdSet = (0..100).collect();
        let rendered = format!("{:?}", set);
        assert!(rendered.contains("100 total"));
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let set = IdSet::from([0, 17, 1_500_000_000_000, u64::MAX]);
        let bytes = rmp_serde::to_vec(&set).unwrap();
        let decoded: IdSet = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, set);
    }

    #[test]
    fn test_json_roundtrip() {
        let set = IdSet::from([3, 300, 30_000]);
        let json = serde_json::to_string(&set).unwrap();
        let decoded: IdSet = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, set);
    }
}
