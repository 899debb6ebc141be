//! Property tests for set algebra, the ID codec and chain folding.

use follow_ledger::ids::codec;
use follow_ledger::{diff, AccountId, ChainConfig, ChainManager, IdSet, Store, StoreConfig, Timestamp};
use proptest::collection::{btree_set, vec};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

fn id_set(max_len: usize) -> impl Strategy<Value = IdSet> {
    // Narrow range so consecutive captures overlap a lot.
    btree_set(0u64..500, 0..max_len).prop_map(|ids| ids.into_iter().collect())
}

fn wide_id_set() -> impl Strategy<Value = IdSet> {
    btree_set(any::<u64>(), 0..64).prop_map(|ids| ids.into_iter().collect())
}

proptest! {
    #[test]
    fn diff_reproduces_current(previous in id_set(200), current in id_set(200)) {
        let change = diff(&previous, &current);

        prop_assert!(change.additions.is_disjoint(&change.removals));
        prop_assert!(change.is_consistent());
        prop_assert!(change.additions.iter().all(|id| current.contains(id) && !previous.contains(id)));
        prop_assert!(change.removals.iter().all(|id| previous.contains(id) && !current.contains(id)));

        let applied = previous.apply(&change.additions, &change.removals).unwrap();
        prop_assert_eq!(applied, current);
    }

    #[test]
    fn diff_against_empty(set in id_set(200)) {
        let first = diff(&IdSet::new(), &set);
        prop_assert_eq!(&first.additions, &set);
        prop_assert!(first.removals.is_empty());

        let gone = diff(&set, &IdSet::new());
        prop_assert!(gone.additions.is_empty());
        prop_assert_eq!(&gone.removals, &set);

        prop_assert!(diff(&set, &set).is_empty());
    }

    #[test]
    fn codec_preserves_sets(set in wide_id_set()) {
        let bytes = codec::encode(set.as_slice());
        let decoded = codec::decode(&bytes, set.len()).unwrap();
        prop_assert_eq!(decoded.as_slice(), set.as_slice());
    }

    #[test]
    fn from_unsorted_sorts_and_dedups(ids in vec(0u64..100, 0..100)) {
        let set = IdSet::from_unsorted(ids.clone());
        prop_assert!(set.as_slice().windows(2).all(|w| w[0] < w[1]));
        prop_assert!(ids.iter().all(|&id| set.contains(id)));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn fold_matches_cache(
        captures in vec((id_set(60), id_set(20)), 1..24),
        checkpoint_every in 0u64..5,
    ) {
        let dir = TempDir::new().unwrap();
        let store = Store::create(StoreConfig {
            path: dir.path().join("store"),
            create_if_missing: true,
            sync_interval: 16,
        })
        .unwrap();
        let manager = ChainManager::new(
            Arc::new(store),
            ChainConfig { checkpoint_every, ..Default::default() },
        );
        let account = AccountId(3);

        for (cycle, (followers, followed)) in captures.iter().enumerate() {
            manager
                .commit(account, Timestamp(cycle as i64), followers.clone(), followed.clone())
                .unwrap();
        }

        let (followers, followed) = captures.last().unwrap();
        let cached = manager.materialized(account).unwrap();
        prop_assert_eq!(&cached.followers, followers);
        prop_assert_eq!(&cached.followed, followed);

        let refolded = manager.refold(account).unwrap();
        prop_assert_eq!(&*refolded, &*cached);

        // Every historical state matches the capture taken at that time.
        for (cycle, (followers, followed)) in captures.iter().enumerate() {
            let at = manager.state_at(account, Timestamp(cycle as i64)).unwrap();
            prop_assert_eq!(&at.followers, followers);
            prop_assert_eq!(&at.followed, followed);
        }

        prop_assert_eq!(manager.store().verify_chain(account).unwrap(), captures.len());
    }
}
