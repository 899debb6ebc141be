//! Capture cycles against external collaborators.
//!
//! A [`Collector`] produces complete follower and followed sets; the runner
//! bounds each fetch in time, honors cancellation, and only hands complete
//! sets to the chain manager. An optional [`Registry`] refreshes the account's
//! display name after the batch is stored.

mod cancel;
mod runner;

pub use cancel::CancelToken;
pub use runner::{CaptureConfig, CaptureOutcome, CaptureRunner};

use crate::ids::IdSet;
use crate::types::{AccountId, Side};
use thiserror::Error;

/// Why a collector could not produce a complete set.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Pagination stopped before the end of the list.
    #[error("incomplete listing: {0}")]
    Incomplete(String),

    #[error("rate limited")]
    RateLimited,

    #[error("account {0} is not accessible")]
    Inaccessible(AccountId),

    #[error("cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Why a display name lookup failed.
#[derive(Debug, Error)]
#[error("screen name lookup failed: {0}")]
pub struct RegistryError(pub String);

/// Source of membership snapshots.
pub trait Collector: Send + Sync + 'static {
    /// Fetch the complete set for one side of an account.
    ///
    /// Must return either every ID or an error; a partial set is never
    /// acceptable. Long fetches should poll `cancel`.
    fn fetch(&self, account: AccountId, side: Side, cancel: &CancelToken) -> Result<IdSet, FetchError>;
}

/// Source of account display names.
pub trait Registry: Send + Sync + 'static {
    fn resolve_screen_name(&self, account: AccountId) -> Result<Option<String>, RegistryError>;
}
