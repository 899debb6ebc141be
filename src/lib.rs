//! # Follow Ledger
//!
//! Delta storage for follower/followed snapshots of tracked social accounts.
//!
//! ## Core Concepts
//!
//! - **Batches**: one per capture, holding only the additions and removals
//!   against the previous capture, linked into a chain per account
//! - **Chains**: replaying an account's batches from the first one yields
//!   its current (or any historical) follower and followed sets
//! - **Mentions**: reverse index from any ID to the batches it appears in
//! - **Checkpoints**: persisted materialized state to shorten replays
//!
//! ## Example
//!
//! ```ignore
//! use follow_ledger::{AccountId, ChainConfig, ChainManager, IdSet, Store, StoreConfig, Timestamp};
//! use std::sync::Arc;
//!
//! let store = Store::open_or_create(StoreConfig {
//!     path: "./ledger".into(),
//!     ..Default::default()
//! })?;
//! let chains = ChainManager::new(Arc::new(store), ChainConfig::default());
//!
//! let account = AccountId(42);
//! chains.commit(account, Timestamp(1), IdSet::from([1, 2, 3]), IdSet::new())?;
//! let batch = chains.commit(account, Timestamp(2), IdSet::from([2, 3, 4]), IdSet::new())?;
//! assert_eq!(batch.follower_change.additions, IdSet::from([4]));
//!
//! for mention in chains.store().find_batches_mentioning(1) {
//!     println!("{:?} in batch {} of {}", mention.role, mention.batch, mention.account);
//! }
//! ```

pub mod accounts;
pub mod batches;
pub mod capture;
pub mod chain;
pub mod checkpoints;
pub mod diff;
pub mod error;
pub mod frames;
pub mod ids;
pub mod mentions;
pub mod store;
pub mod types;

// Re-exports
pub use capture::{
    CancelToken, CaptureConfig, CaptureOutcome, CaptureRunner, Collector, FetchError, Registry,
    RegistryError,
};
pub use chain::{ChainConfig, ChainHead, ChainManager, Materialized};
pub use checkpoints::Checkpoint;
pub use diff::{diff, Change};
pub use error::{Result, StoreError};
pub use ids::IdSet;
pub use mentions::{Mention, Mentions};
pub use store::{ChainIter, Store, StoreConfig, VerifyReport};
pub use types::*;
