//! Capture cycle orchestration per account.

use super::state::{fold, ChainHead, Materialized};
use crate::diff::diff;
use crate::error::{Result, StoreError};
use crate::ids::IdSet;
use crate::store::Store;
use crate::types::{AccountId, Batch, BatchInput, CaptureState, Sequence, Timestamp};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Chain manager configuration.
#[derive(Clone, Debug)]
pub struct ChainConfig {
    /// Number of accounts whose materialized state stays in memory.
    pub cache_size: usize,

    /// Write a checkpoint every N batches of a chain (0 disables).
    pub checkpoint_every: u64,

    /// Refold and retry once when another writer extended the chain first.
    pub retry_on_conflict: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            cache_size: 1024,
            checkpoint_every: 64,
            retry_on_conflict: true,
        }
    }
}

/// Turns complete captures into batches and keeps materialized state.
///
/// Cycles for one account are serialized; different accounts proceed in
/// parallel. The cache only ever holds states that were folded from, or
/// committed to, the store.
pub struct ChainManager {
    store: Arc<Store>,
    config: ChainConfig,
    cache: Mutex<LruCache<AccountId, Arc<Materialized>>>,
    account_locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl ChainManager {
    pub fn new(store: Arc<Store>, config: ChainConfig) -> Self {
        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            config,
            cache: Mutex::new(LruCache::new(cache_size)),
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Record a complete capture of both sides of an account.
    ///
    /// The first capture is stored as all additions; later ones as the diff
    /// against the current materialized state. Nothing is written if the
    /// timestamp is not after the latest capture.
    pub fn commit(
        &self,
        account: AccountId,
        timestamp: Timestamp,
        followers: IdSet,
        followed: IdSet,
    ) -> Result<Batch> {
        let lock = self.account_lock(account);
        let _guard = lock.lock();

        self.commit_locked(account, timestamp, followers, followed)
            .map_err(|e| e.in_cycle(account, timestamp))
    }

    fn commit_locked(
        &self,
        account: AccountId,
        timestamp: Timestamp,
        followers: IdSet,
        followed: IdSet,
    ) -> Result<Batch> {
        let mut retried = false;

        loop {
            let state = self.materialized(account)?;

            let input = match state.head {
                Some(head) if timestamp <= head.timestamp => {
                    return Err(StoreError::OutOfOrderCapture {
                        account,
                        attempted: timestamp,
                        latest: head.timestamp,
                    });
                }
                Some(head) => BatchInput {
                    account,
                    timestamp,
                    parent: Some(head.batch),
                    follower_change: diff(&state.followers, &followers),
                    followed_change: diff(&state.followed, &followed),
                },
                None => BatchInput::initial(account, timestamp, followers.clone(), followed.clone()),
            };

            match self.store.append(input) {
                Ok(batch) => {
                    self.committed(&batch, followers, followed);
                    return Ok(batch);
                }
                Err(e @ StoreError::ChainConflict { .. }) => {
                    self.invalidate(account);
                    if retried || !self.config.retry_on_conflict {
                        return Err(e);
                    }
                    warn!(%account, %timestamp, "chain moved during cycle, refolding");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cache the post-commit state and checkpoint it if due.
    fn committed(&self, batch: &Batch, followers: IdSet, followed: IdSet) {
        let state = Materialized {
            account: batch.account,
            followers,
            followed,
            head: Some(ChainHead {
                batch: batch.id,
                sequence: batch.sequence,
                timestamp: batch.timestamp,
            }),
        };

        info!(
            account = %batch.account,
            batch = %batch.id,
            timestamp = %batch.timestamp,
            followers = state.followers.len(),
            followed = state.followed.len(),
            added = batch.follower_change.additions.len() + batch.followed_change.additions.len(),
            removed = batch.follower_change.removals.len() + batch.followed_change.removals.len(),
            "committed capture"
        );

        let every = self.config.checkpoint_every;
        if every > 0 && batch.sequence.0 % every == 0 {
            if let Some(checkpoint) = state.to_checkpoint() {
                // Non-fatal: the batch itself is stored.
                if let Err(e) = self.store.write_checkpoint(&checkpoint) {
                    warn!(account = %batch.account, batch = %batch.id, error = %e, "checkpoint failed");
                }
            }
        }

        self.cache_put(Arc::new(state));
    }

    /// Current materialized state of an account.
    ///
    /// Served from the cache when it matches the stored head, otherwise
    /// folded from the latest checkpoint.
    pub fn materialized(&self, account: AccountId) -> Result<Arc<Materialized>> {
        let head = self.store.head(account);

        if let Some(cached) = self.cache.lock().get(&account).cloned() {
            if cached.head.map(|h| h.batch) == head.map(|h| h.id) {
                return Ok(cached);
            }
        }

        let state = match head {
            Some(head) => Arc::new(self.fold_through(account, head.sequence)?),
            None => Arc::new(Materialized::empty(account)),
        };
        self.cache_put(Arc::clone(&state));
        Ok(state)
    }

    /// Rebuild an account's state from its first batch, ignoring the cache
    /// and checkpoints, and replace the cached copy.
    pub fn refold(&self, account: AccountId) -> Result<Arc<Materialized>> {
        self.invalidate(account);

        let state = Arc::new(fold(
            Materialized::empty(account),
            self.store.iter_chain(account),
        )?);
        debug!(%account, sequence = state.sequence().0, "refolded from first batch");

        self.cache_put(Arc::clone(&state));
        Ok(state)
    }

    /// State of an account as of its latest capture at or before `at`.
    ///
    /// Empty if the account had not been captured yet.
    pub fn state_at(&self, account: AccountId, at: Timestamp) -> Result<Materialized> {
        let target = match self.store.batch_at_or_before(account, at) {
            Some(meta) => meta,
            None => return Ok(Materialized::empty(account)),
        };

        if let Some(cached) = self.cache.lock().peek(&account) {
            if cached.head.map(|h| h.batch) == Some(target.id) {
                return Ok(Materialized::clone(cached));
            }
        }

        self.fold_through(account, target.sequence)
    }

    pub fn capture_state(&self, account: AccountId) -> CaptureState {
        match self.store.head(account).map(|h| h.sequence) {
            None => CaptureState::Uninitialized,
            Some(Sequence::FIRST) => CaptureState::Initialized,
            Some(_) => CaptureState::Updated,
        }
    }

    /// Drop the cached state of an account.
    pub fn invalidate(&self, account: AccountId) {
        self.cache.lock().pop(&account);
    }

    /// Fold up to `through`, starting from the latest usable checkpoint.
    fn fold_through(&self, account: AccountId, through: Sequence) -> Result<Materialized> {
        let start = self
            .store
            .latest_checkpoint(account, through)?
            .map_or_else(|| Materialized::empty(account), Materialized::from_checkpoint);

        let from = start.sequence();
        let batches = self
            .store
            .iter_chain_after(account, from)
            .take_while(|batch| batch.as_ref().map_or(true, |b| b.sequence <= through));
        let state = fold(start, batches)?;

        debug!(%account, from = from.0, through = through.0, "folded chain");
        Ok(state)
    }

    /// Keep whichever of the cached and new state is further along.
    fn cache_put(&self, state: Arc<Materialized>) {
        let mut cache = self.cache.lock();
        let stale = cache
            .peek(&state.account)
            .map_or(true, |cached| cached.sequence() <= state.sequence());
        if stale {
            cache.put(state.account, state);
        }
    }

    fn account_lock(&self, account: AccountId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.account_locks
                .lock()
                .entry(account)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, config: ChainConfig) -> ChainManager {
        let store = Store::create(StoreConfig {
            path: dir.path().join("store"),
            ..Default::default()
        })
        .unwrap();
        ChainManager::new(Arc::new(store), config)
    }

    #[test]
    fn test_first_then_diff() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ChainConfig::default());
        let account = AccountId(1);

        assert_eq!(manager.capture_state(account), CaptureState::Uninitialized);

        let first = manager
            .commit(account, Timestamp(1), IdSet::from([1, 2, 3]), IdSet::from([7]))
            .unwrap();
        assert_eq!(first.follower_change.additions, IdSet::from([1, 2, 3]));
        assert!(first.follower_change.removals.is_empty());
        assert_eq!(manager.capture_state(account), CaptureState::Initialized);

        let second = manager
            .commit(account, Timestamp(2), IdSet::from([2, 3, 4]), IdSet::from([7]))
            .unwrap();
        assert_eq!(second.follower_change.additions, IdSet::from([4]));
        assert_eq!(second.follower_change.removals, IdSet::from([1]));
        assert!(second.followed_change.is_empty());
        assert_eq!(manager.capture_state(account), CaptureState::Updated);

        let state = manager.materialized(account).unwrap();
        assert_eq!(state.followers, IdSet::from([2, 3, 4]));
        assert_eq!(state.followed, IdSet::from([7]));
        assert_eq!(*manager.refold(account).unwrap(), *state);
    }

    #[test]
    fn test_out_of_order_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ChainConfig::default());
        let account = AccountId(1);

        manager
            .commit(account, Timestamp(10), IdSet::from([1]), IdSet::new())
            .unwrap();
        let result = manager.commit(account, Timestamp(5), IdSet::from([2]), IdSet::new());

        assert!(matches!(
            result,
            Err(StoreError::OutOfOrderCapture {
                attempted: Timestamp(5),
                latest: Timestamp(10),
                ..
            })
        ));
        assert_eq!(manager.store().chain(account).len(), 1);
        assert_eq!(manager.materialized(account).unwrap().followers, IdSet::from([1]));
    }

    #[test]
    fn test_checkpoints_written_and_used() {
        let dir = TempDir::new().unwrap();
        let manager = manager(
            &dir,
            ChainConfig {
                checkpoint_every: 3,
                ..Default::default()
            },
        );
        let account = AccountId(5);

        for i in 1..=7u64 {
            let followers: IdSet = (i..i + 5).collect();
            manager
                .commit(account, Timestamp(i as i64), followers, IdSet::new())
                .unwrap();
        }
        assert_eq!(manager.store().stats().checkpoint_count, 2);

        manager.invalidate(account);
        let from_checkpoint = manager.materialized(account).unwrap();
        let from_genesis = manager.refold(account).unwrap();
        assert_eq!(*from_checkpoint, *from_genesis);
        assert_eq!(from_genesis.followers, (7..12).collect::<IdSet>());
    }

    #[test]
    fn test_state_at() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, ChainConfig::default());
        let account = AccountId(1);

        manager
            .commit(account, Timestamp(100), IdSet::from([1, 2]), IdSet::new())
            .unwrap();
        manager
            .commit(account, Timestamp(200), IdSet::from([2, 3]), IdSet::new())
            .unwrap();
        manager
            .commit(account, Timestamp(300), IdSet::from([3]), IdSet::from([8]))
            .unwrap();

        assert!(manager.state_at(account, Timestamp(50)).unwrap().head.is_none());
        assert_eq!(
            manager.state_at(account, Timestamp(150)).unwrap().followers,
            IdSet::from([1, 2])
        );
        assert_eq!(
            manager.state_at(account, Timestamp(200)).unwrap().followers,
            IdSet::from([2, 3])
        );
        let latest = manager.state_at(account, Timestamp(1_000)).unwrap();
        assert_eq!(latest.followers, IdSet::from([3]));
        assert_eq!(latest.followed, IdSet::from([8]));
    }

    #[test]
    fn test_cache_follows_other_writers() {
        let dir = TempDir::new().unwrap();
        let first = manager(&dir, ChainConfig::default());
        let second = ChainManager::new(Arc::clone(first.store()), ChainConfig::default());
        let account = AccountId(3);

        first
            .commit(account, Timestamp(1), IdSet::from([1]), IdSet::new())
            .unwrap();
        first.materialized(account).unwrap();

        second
            .commit(account, Timestamp(2), IdSet::from([1, 2]), IdSet::new())
            .unwrap();

        // The first manager's cached state is behind the store head.
        let batch = first
            .commit(account, Timestamp(3), IdSet::from([2]), IdSet::new())
            .unwrap();
        assert_eq!(batch.follower_change.removals, IdSet::from([1]));
        assert!(batch.follower_change.additions.is_empty());
    }
}
