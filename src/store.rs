//! Main Store struct tying all components together.

use crate::accounts::AccountRegistry;
use crate::batches::{BatchLog, BatchMeta, ChainIndex};
use crate::checkpoints::{Checkpoint, CheckpointStore};
use crate::error::{Result, StoreError};
use crate::ids::IdSet;
use crate::mentions::{Mention, MentionIndex, Mentions};
use crate::types::{
    AccountId, Batch, BatchId, BatchInput, Sequence, Side, StoreStats, Timestamp, TrackedAccount,
};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Sync the batch log every N appends (1 means every append).
    pub sync_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./follow-ledger"),
            create_if_missing: true,
            sync_interval: 1,
        }
    }
}

/// Result of a full store verification.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub accounts: usize,
    pub batches: usize,
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"FLG\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const BATCH_LOG_FILE: &str = "batches.log";
const MENTION_INDEX_FILE: &str = "mentions.idx";
const ACCOUNTS_FILE: &str = "accounts.log";
const CHECKPOINTS_FILE: &str = "checkpoints.log";

/// The batch store.
///
/// Provides a unified interface for:
/// - Appending batches to per-account chains
/// - Traversing and verifying chains
/// - Looking up which batches mention an ID
/// - Tracked account names and state checkpoints
pub struct Store {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Batch log.
    log: BatchLog,

    /// Per-account chains, rebuilt from the log on open.
    chains: ChainIndex,

    /// ID to batches reverse index.
    mentions: MentionIndex,

    /// Last-known display names.
    accounts: AccountRegistry,

    /// Materialized state checkpoints.
    checkpoints: CheckpointStore,

    /// Serializes head checks with the append that follows them.
    write_lock: Mutex<()>,
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        info!(path = %config.path.display(), "created store");

        Self::assemble(config, lock_file)
    }

    /// Open an existing store.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if !config.path.join("MANIFEST").exists() {
            return Err(StoreError::NotInitialized);
        }
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;

        Self::assemble(config, lock_file)
    }

    fn assemble(config: StoreConfig, lock_file: File) -> Result<Self> {
        let log = BatchLog::open(config.path.join(BATCH_LOG_FILE), config.sync_interval)?;
        let chains = ChainIndex::new();

        let index_path = config.path.join(MENTION_INDEX_FILE);
        let mentions = match MentionIndex::load(&index_path) {
            Ok(index) => index,
            Err(e) => {
                warn!(error = %e, "discarding unreadable mention index");
                MentionIndex::new(&index_path)
            }
        };
        if let Some(watermark) = mentions.watermark() {
            if watermark >= log.next_id() {
                warn!(%watermark, next = %log.next_id(), "mention index is ahead of the log, rebuilding");
                mentions.clear();
            }
        }

        Self::rebuild_indexes(&log, &chains, &mentions)?;

        let accounts = AccountRegistry::open(config.path.join(ACCOUNTS_FILE))?;
        let checkpoints = CheckpointStore::open(config.path.join(CHECKPOINTS_FILE))?;

        info!(
            path = %config.path.display(),
            batches = chains.count(),
            accounts = chains.accounts().len(),
            "opened store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            chains,
            mentions,
            accounts,
            checkpoints,
            write_lock: Mutex::new(()),
        })
    }

    /// Rebuild the chain index from the log and replay batches the saved
    /// mention index does not cover yet.
    fn rebuild_indexes(log: &BatchLog, chains: &ChainIndex, mentions: &MentionIndex) -> Result<()> {
        let watermark = mentions.watermark();
        let mut replayed = 0usize;

        log.scan(|record| {
            let header = record.header;
            chains.insert(BatchMeta {
                id: header.id,
                account: header.account,
                sequence: header.sequence,
                timestamp: header.timestamp,
                offset: record.offset,
            })?;

            if watermark.map_or(true, |w| header.id > w) {
                mentions.add(&record.decode()?);
                replayed += 1;
            }
            Ok(())
        })?;

        debug!(batches = chains.count(), replayed, "rebuilt indexes");
        Ok(())
    }

    // --- Batch Operations ---

    /// Append a batch to its account's chain.
    ///
    /// `input.parent` must name the current head (or be `None` for an empty
    /// chain) and the timestamp must be after the head's.
    pub fn append(&self, input: BatchInput) -> Result<Batch> {
        let _lock = self.write_lock.lock();

        for (side, change) in [
            (Side::Follower, &input.follower_change),
            (Side::Followed, &input.followed_change),
        ] {
            if !change.is_consistent() {
                return Err(StoreError::InvalidDiff {
                    account: input.account,
                    timestamp: input.timestamp,
                    reason: format!("{:?} additions and removals overlap", side),
                });
            }
        }

        let head = self.chains.head(input.account);
        let actual = head.map(|h| h.id);
        if input.parent != actual {
            warn!(
                account = %input.account,
                timestamp = %input.timestamp,
                expected = ?input.parent,
                actual = ?actual,
                "chain conflict"
            );
            return Err(StoreError::ChainConflict {
                account: input.account,
                timestamp: input.timestamp,
                expected: input.parent,
                actual,
            });
        }

        match head {
            Some(head) if input.timestamp <= head.timestamp => {
                return Err(StoreError::OutOfOrderCapture {
                    account: input.account,
                    attempted: input.timestamp,
                    latest: head.timestamp,
                });
            }
            None if !input.follower_change.removals.is_empty()
                || !input.followed_change.removals.is_empty() =>
            {
                return Err(StoreError::InvalidDiff {
                    account: input.account,
                    timestamp: input.timestamp,
                    reason: "first batch carries removals".into(),
                });
            }
            _ => {}
        }

        let sequence = head.map_or(Sequence::FIRST, |h| h.sequence.next());
        let (batch, offset) = self.log.append(&input, sequence)?;

        self.mentions.add(&batch);
        self.chains.insert(BatchMeta {
            id: batch.id,
            account: batch.account,
            sequence: batch.sequence,
            timestamp: batch.timestamp,
            offset,
        })?;

        debug!(
            account = %batch.account,
            batch = %batch.id,
            sequence = batch.sequence.0,
            timestamp = %batch.timestamp,
            follower_changes = batch.follower_change.len(),
            followed_changes = batch.followed_change.len(),
            "appended batch"
        );

        Ok(batch)
    }

    /// Get a batch by ID, with its forward link resolved.
    pub fn get_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        let meta = match self.chains.get(id) {
            Some(meta) => meta,
            None => return Ok(None),
        };

        let mut batch = self.log.read_at(meta.offset)?;
        if batch.id != id {
            return Err(StoreError::Corruption(format!(
                "Batch {} found at offset {} of batch {}",
                batch.id, meta.offset, id
            )));
        }
        batch.next_id = self.chains.next_of(id);
        Ok(Some(batch))
    }

    /// Get a batch that is known to exist.
    pub fn batch(&self, id: BatchId) -> Result<Batch> {
        self.get_batch(id)?.ok_or(StoreError::BatchNotFound(id))
    }

    pub fn head(&self, account: AccountId) -> Option<BatchMeta> {
        self.chains.head(account)
    }

    /// Batch IDs of an account's chain, in order.
    pub fn chain(&self, account: AccountId) -> Vec<BatchId> {
        self.chains.chain(account).into_iter().map(|m| m.id).collect()
    }

    /// Chain metadata without loading ID sets.
    pub fn chain_meta(&self, account: AccountId) -> Vec<BatchMeta> {
        self.chains.chain(account)
    }

    pub fn batch_at(&self, account: AccountId, sequence: Sequence) -> Option<BatchMeta> {
        self.chains.at_sequence(account, sequence)
    }

    /// Latest batch captured at or before `at`.
    pub fn batch_at_or_before(&self, account: AccountId, at: Timestamp) -> Option<BatchMeta> {
        self.chains.at_or_before(account, at)
    }

    /// The batch that follows `id` in its chain.
    pub fn next_id(&self, id: BatchId) -> Option<BatchId> {
        self.chains.next_of(id)
    }

    /// Walk an account's chain from the first batch, loading batches lazily.
    pub fn iter_chain(&self, account: AccountId) -> ChainIter<'_> {
        ChainIter {
            store: self,
            next: self.chains.first(account).map(|m| m.id),
        }
    }

    /// Walk an account's chain starting after `after`.
    pub fn iter_chain_after(&self, account: AccountId, after: Sequence) -> ChainIter<'_> {
        ChainIter {
            store: self,
            next: self.chains.at_sequence(account, after.next()).map(|m| m.id),
        }
    }

    /// Check an account's chain against the log.
    ///
    /// Follows forward links from the first batch and checks that every batch
    /// is visited once, in sequence and timestamp order, with readable and
    /// consistent diff sets. Returns the number of batches.
    pub fn verify_chain(&self, account: AccountId) -> Result<usize> {
        let expected = self.chains.len(account);
        let mut visited = HashSet::with_capacity(expected);
        let mut previous: Option<Batch> = None;
        let mut next = self.chains.first(account).map(|m| m.id);

        while let Some(id) = next {
            if !visited.insert(id) {
                return Err(StoreError::Corruption(format!(
                    "Chain of account {} revisits batch {}",
                    account, id
                )));
            }

            let batch = self.batch(id)?;
            if batch.account != account {
                return Err(StoreError::Corruption(format!(
                    "Batch {} of account {} is linked from account {}",
                    id, batch.account, account
                )));
            }

            match &previous {
                None => {
                    if batch.sequence != Sequence::FIRST {
                        return Err(StoreError::Corruption(format!(
                            "Chain of account {} starts at {:?}",
                            account, batch.sequence
                        )));
                    }
                    if !batch.follower_change.removals.is_empty()
                        || !batch.followed_change.removals.is_empty()
                    {
                        return Err(StoreError::Corruption(format!(
                            "First batch {} of account {} has removals",
                            id, account
                        )));
                    }
                }
                Some(prev) => {
                    if batch.sequence != prev.sequence.next() || batch.timestamp <= prev.timestamp {
                        return Err(StoreError::Corruption(format!(
                            "Batch {} does not follow batch {} in account {}",
                            id, prev.id, account
                        )));
                    }
                }
            }

            if !batch.follower_change.is_consistent() || !batch.followed_change.is_consistent() {
                return Err(StoreError::Corruption(format!(
                    "Batch {} adds and removes the same ID",
                    id
                )));
            }

            next = batch.next_id;
            previous = Some(batch);
        }

        if visited.len() != expected {
            return Err(StoreError::Corruption(format!(
                "Chain of account {} reaches {} of {} batches",
                account,
                visited.len(),
                expected
            )));
        }

        Ok(visited.len())
    }

    /// Verify every chain in the store.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        for account in self.chains.accounts() {
            report.batches += self.verify_chain(account)?;
            report.accounts += 1;
        }

        if report.batches != self.chains.count() {
            return Err(StoreError::Corruption(format!(
                "{} batches indexed but {} reachable",
                self.chains.count(),
                report.batches
            )));
        }

        info!(accounts = report.accounts, batches = report.batches, "verified store");
        Ok(report)
    }

    // --- Reverse Lookup ---

    /// Every batch mentioning `id`, ordered by capture time.
    ///
    /// Empty when the ID was never seen.
    pub fn find_batches_mentioning(&self, id: u64) -> Mentions {
        let mentions = self
            .mentions
            .get(id)
            .into_iter()
            .filter_map(|posting| {
                self.chains.get(posting.batch).map(|meta| Mention {
                    batch: posting.batch,
                    account: meta.account,
                    timestamp: meta.timestamp,
                    role: posting.role,
                })
            })
            .collect();
        Mentions::new(mentions)
    }

    /// Load the batches behind a set of mentions, one at a time.
    pub fn mentioned_batches<'a>(&'a self, mentions: &Mentions) -> impl Iterator<Item = Result<Batch>> + 'a {
        mentions.batch_ids().into_iter().map(move |id| self.batch(id))
    }

    /// Every ID mentioned by at least one batch.
    pub fn known_ids(&self) -> IdSet {
        self.mentions.known_ids()
    }

    // --- Tracked Accounts ---

    pub fn tracked_account(&self, account: AccountId) -> Option<TrackedAccount> {
        let screen_name = self.accounts.screen_name(account);
        let first = self.chains.first(account);
        if first.is_none() && screen_name.is_none() {
            return None;
        }

        Some(TrackedAccount {
            id: account,
            screen_name,
            first_capture: first.map(|m| m.timestamp),
            last_capture: self.chains.head(account).map(|m| m.timestamp),
            batch_count: self.chains.len(account) as u64,
        })
    }

    /// Every account with a batch or a known name, ascending.
    pub fn tracked_accounts(&self) -> Vec<TrackedAccount> {
        let ids: BTreeSet<AccountId> = self
            .chains
            .accounts()
            .into_iter()
            .chain(self.accounts.accounts())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.tracked_account(id))
            .collect()
    }

    /// Record a display name observation. Returns whether the name changed.
    pub fn update_screen_name(
        &self,
        account: AccountId,
        screen_name: &str,
        observed_at: Timestamp,
    ) -> Result<bool> {
        let changed = self.accounts.observe(account, screen_name, observed_at)?;
        if changed {
            debug!(%account, screen_name, "updated screen name");
        }
        Ok(changed)
    }

    /// Latest capture time of every account with a chain, oldest first.
    pub fn last_captures(&self) -> Vec<(AccountId, Timestamp)> {
        let mut captures: Vec<_> = self
            .chains
            .accounts()
            .into_iter()
            .filter_map(|account| self.chains.head(account).map(|m| (account, m.timestamp)))
            .collect();
        captures.sort_by_key(|(account, timestamp)| (*timestamp, *account));
        captures
    }

    // --- Checkpoints ---

    pub fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let meta = self.chains.get(checkpoint.batch);
        let matches = meta.map_or(false, |m| {
            m.account == checkpoint.account
                && m.sequence == checkpoint.sequence
                && m.timestamp == checkpoint.timestamp
        });
        if !matches {
            return Err(StoreError::Corruption(format!(
                "Checkpoint for account {} names unknown batch {}",
                checkpoint.account, checkpoint.batch
            )));
        }

        // A checkpoint must never outlive its batch in a torn tail.
        self.log.sync()?;
        self.checkpoints.write(checkpoint)?;
        debug!(
            account = %checkpoint.account,
            batch = %checkpoint.batch,
            sequence = checkpoint.sequence.0,
            "wrote checkpoint"
        );
        Ok(())
    }

    /// Latest usable checkpoint at or before `through`.
    ///
    /// Checkpoints whose batch is not in the chain (e.g. the log tail was
    /// lost after the checkpoint was written) are skipped.
    pub fn latest_checkpoint(&self, account: AccountId, through: Sequence) -> Result<Option<Checkpoint>> {
        for candidate in self.checkpoints.candidates(account, through) {
            let in_chain = self
                .chains
                .at_sequence(account, candidate.sequence)
                .map_or(false, |m| m.id == candidate.batch && m.timestamp == candidate.timestamp);
            if !in_chain {
                warn!(%account, batch = %candidate.batch, "skipping checkpoint not in chain");
                continue;
            }

            match self.checkpoints.load(&candidate) {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => {
                    warn!(%account, batch = %candidate.batch, error = %e, "skipping unreadable checkpoint");
                }
            }
        }
        Ok(None)
    }

    // --- Utility ---

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            batch_count: self.chains.count() as u64,
            account_count: self.chains.accounts().len() as u64,
            mentioned_id_count: self.mentions.id_count() as u64,
            checkpoint_count: self.checkpoints.count() as u64,
            log_size_bytes: self.log.size(),
        }
    }

    /// Flush the batch log and save the mention index.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()?;
        self.mentions.save()?;
        Ok(())
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // --- Internal ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!(error = %e, "sync on close failed");
        }
    }
}

/// Lazy walk along `next_id` links.
///
/// Stops after the first error.
pub struct ChainIter<'a> {
    store: &'a Store,
    next: Option<BatchId>,
}

impl Iterator for ChainIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        match self.store.batch(id) {
            Ok(batch) => {
                self.next = batch.next_id;
                Some(Ok(batch))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
