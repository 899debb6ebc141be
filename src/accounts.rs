//! Tracked account display names.
//!
//! Only the last-known screen name is kept; history is not versioned. Every
//! change is appended to a framed log and replayed on open.

use crate::error::Result;
use crate::frames::FrameLog;
use crate::types::{AccountId, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct NameObservation {
    account: AccountId,
    screen_name: String,
    observed_at: Timestamp,
}

/// Last-known screen name per account.
pub struct AccountRegistry {
    log: FrameLog<NameObservation>,
    names: RwLock<HashMap<AccountId, (String, Timestamp)>>,
}

impl AccountRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (log, entries) = FrameLog::<NameObservation>::open(path)?;

        let mut names: HashMap<AccountId, (String, Timestamp)> = HashMap::new();
        for (_, observation) in entries {
            let fresher = names
                .get(&observation.account)
                .map_or(true, |(_, seen)| observation.observed_at >= *seen);
            if fresher {
                names.insert(
                    observation.account,
                    (observation.screen_name, observation.observed_at),
                );
            }
        }

        Ok(Self {
            log,
            names: RwLock::new(names),
        })
    }

    pub fn screen_name(&self, account: AccountId) -> Option<String> {
        self.names.read().get(&account).map(|(name, _)| name.clone())
    }

    /// Record a screen name seen at `observed_at`.
    ///
    /// Observations older than the current one are ignored. Returns whether
    /// the stored name changed.
    pub fn observe(&self, account: AccountId, screen_name: &str, observed_at: Timestamp) -> Result<bool> {
        let mut names = self.names.write();

        match names.get_mut(&account) {
            Some((_, seen)) if observed_at < *seen => return Ok(false),
            Some((name, seen)) if name == screen_name => {
                *seen = observed_at;
                return Ok(false);
            }
            _ => {}
        }

        self.log.append(&NameObservation {
            account,
            screen_name: screen_name.to_string(),
            observed_at,
        })?;
        names.insert(account, (screen_name.to_string(), observed_at));

        Ok(true)
    }

    /// Accounts with a known name, ascending.
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<_> = self.names.read().keys().copied().collect();
        accounts.sort_unstable();
        accounts
    }
}
