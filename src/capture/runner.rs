use super::{CancelToken, Collector, FetchError, Registry};
use crate::chain::ChainManager;
use crate::error::{Result, StoreError};
use crate::ids::IdSet;
use crate::types::{AccountId, Batch, CaptureState, Side, Timestamp};
use crossbeam_channel::{at, bounded, select, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info_span, warn};

/// Capture runner configuration.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Upper bound for fetching both sides of one account.
    pub fetch_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of a successful capture cycle.
#[derive(Clone, Debug)]
pub struct CaptureOutcome {
    pub batch: Batch,
    pub state: CaptureState,
    /// Whether the registry reported a new display name.
    pub screen_name_changed: bool,
}

/// Runs fetch, diff and append for one account at a time.
pub struct CaptureRunner {
    chains: Arc<ChainManager>,
    collector: Arc<dyn Collector>,
    registry: Option<Arc<dyn Registry>>,
    config: CaptureConfig,
}

type FetchResult = std::result::Result<IdSet, FetchError>;

impl CaptureRunner {
    pub fn new(chains: Arc<ChainManager>, collector: Arc<dyn Collector>, config: CaptureConfig) -> Self {
        Self {
            chains,
            collector,
            registry: None,
            config,
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn chains(&self) -> &Arc<ChainManager> {
        &self.chains
    }

    /// Capture an account now.
    pub fn run(&self, account: AccountId, cancel: &CancelToken) -> Result<CaptureOutcome> {
        self.run_at(account, Timestamp::now(), cancel)
    }

    /// Capture an account, stamping the batch with `timestamp`.
    ///
    /// Both sides are fetched in parallel. If either fetch fails, times out,
    /// or the cycle is cancelled, nothing is written and the error is
    /// `FetchIncomplete`.
    pub fn run_at(&self, account: AccountId, timestamp: Timestamp, cancel: &CancelToken) -> Result<CaptureOutcome> {
        let span = info_span!("capture", %account, %timestamp);
        let _enter = span.enter();

        let (followers, followed) = self.fetch_both(account, timestamp, cancel)?;
        debug!(followers = followers.len(), followed = followed.len(), "fetched");

        let batch = self.chains.commit(account, timestamp, followers, followed)?;
        let screen_name_changed = self.refresh_screen_name(account, timestamp);

        Ok(CaptureOutcome {
            state: self.chains.capture_state(account),
            batch,
            screen_name_changed,
        })
    }

    fn fetch_both(&self, account: AccountId, timestamp: Timestamp, cancel: &CancelToken) -> Result<(IdSet, IdSet)> {
        let incomplete = |reason: String| StoreError::FetchIncomplete {
            account,
            timestamp,
            reason,
        };

        // Cancelled on abort so workers can stop early.
        let workers = CancelToken::new();
        let deadline = Instant::now() + self.config.fetch_timeout;

        let result = self
            .spawn_fetch(account, Side::Follower, &workers)
            .and_then(|follower_rx| {
                let followed_rx = self.spawn_fetch(account, Side::Followed, &workers)?;
                let followers = wait(&follower_rx, Side::Follower, deadline, cancel)?;
                let followed = wait(&followed_rx, Side::Followed, deadline, cancel)?;
                Ok((followers, followed))
            });

        match result {
            Ok(sets) if !cancel.is_cancelled() => Ok(sets),
            Ok(_) => {
                workers.cancel();
                Err(incomplete("cancelled".into()))
            }
            Err(reason) => {
                workers.cancel();
                warn!(%reason, "fetch failed, nothing written");
                Err(incomplete(reason))
            }
        }
    }

    fn spawn_fetch(
        &self,
        account: AccountId,
        side: Side,
        workers: &CancelToken,
    ) -> std::result::Result<Receiver<FetchResult>, String> {
        let (tx, rx) = bounded(1);
        let collector = Arc::clone(&self.collector);
        let token = workers.clone();

        thread::Builder::new()
            .name(format!("fetch-{}-{:?}", account, side).to_lowercase())
            .spawn(move || {
                // Receiver may be gone after a timeout.
                let _ = tx.send(collector.fetch(account, side, &token));
            })
            .map_err(|e| format!("could not start {:?} fetch: {}", side, e))?;

        Ok(rx)
    }

    /// Ask the registry for a fresher display name. Failures are logged only.
    fn refresh_screen_name(&self, account: AccountId, timestamp: Timestamp) -> bool {
        let registry = match &self.registry {
            Some(registry) => registry,
            None => return false,
        };

        match registry.resolve_screen_name(account) {
            Ok(Some(name)) => match self.chains.store().update_screen_name(account, &name, timestamp) {
                Ok(changed) => changed,
                Err(e) => {
                    warn!(error = %e, "could not store screen name");
                    false
                }
            },
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "screen name lookup failed");
                false
            }
        }
    }
}

fn wait(
    rx: &Receiver<FetchResult>,
    side: Side,
    deadline: Instant,
    cancel: &CancelToken,
) -> std::result::Result<IdSet, String> {
    select! {
        recv(rx) -> message => match message {
            Ok(Ok(ids)) => Ok(ids),
            Ok(Err(e)) => Err(format!("{:?} fetch failed: {}", side, e)),
            Err(_) => Err(format!("{:?} fetch worker exited without a result", side)),
        },
        recv(cancel.receiver()) -> _ => Err("cancelled".into()),
        recv(at(deadline)) -> _ => Err(format!("{:?} fetch timed out", side)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::RegistryError;
    use crate::chain::ChainConfig;
    use crate::store::{Store, StoreConfig};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[derive(Default)]
    struct ScriptedCollector {
        sets: Mutex<HashMap<(AccountId, Side), IdSet>>,
        failing: Mutex<Option<Side>>,
        delay: Mutex<Option<Duration>>,
    }

    impl ScriptedCollector {
        fn set(&self, account: u64, side: Side, ids: &[u64]) {
            self.sets.lock().insert((AccountId(account), side), IdSet::from(ids));
        }
    }

    impl Collector for ScriptedCollector {
        fn fetch(&self, account: AccountId, side: Side, cancel: &CancelToken) -> std::result::Result<IdSet, FetchError> {
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                let until = Instant::now() + delay;
                while Instant::now() < until {
                    if cancel.is_cancelled() {
                        return Err(FetchError::Cancelled);
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            }
            if *self.failing.lock() == Some(side) {
                return Err(FetchError::Incomplete("page 3 missing".into()));
            }
            Ok(self.sets.lock().get(&(account, side)).cloned().unwrap_or_default())
        }
    }

    struct FixedRegistry(std::result::Result<Option<String>, String>);

    impl Registry for FixedRegistry {
        fn resolve_screen_name(&self, _account: AccountId) -> std::result::Result<Option<String>, RegistryError> {
            self.0.clone().map_err(RegistryError)
        }
    }

    fn runner(dir: &TempDir, collector: Arc<ScriptedCollector>, timeout: Duration) -> CaptureRunner {
        let store = Store::create(StoreConfig {
            path: dir.path().join("store"),
            ..Default::default()
        })
        .unwrap();
        let chains = Arc::new(ChainManager::new(Arc::new(store), ChainConfig::default()));
        CaptureRunner::new(chains, collector, CaptureConfig { fetch_timeout: timeout })
    }

    #[test]
    fn test_successful_cycles() {
        let dir = TempDir::new().unwrap();
        let collector = Arc::new(ScriptedCollector::default());
        let runner = runner(&dir, Arc::clone(&collector), Duration::from_secs(5))
            .with_registry(Arc::new(FixedRegistry(Ok(Some("tracked".into())))));
        let account = AccountId(1);
        let cancel = CancelToken::new();

        collector.set(1, Side::Follower, &[1, 2, 3]);
        collector.set(1, Side::Followed, &[9]);
        let outcome = runner.run_at(account, Timestamp(10), &cancel).unwrap();
        assert_eq!(outcome.state, CaptureState::Initialized);
        assert!(outcome.screen_name_changed);

        collector.set(1, Side::Follower, &[2, 3, 4]);
        let outcome = runner.run_at(account, Timestamp(20), &cancel).unwrap();
        assert_eq!(outcome.state, CaptureState::Updated);
        assert_eq!(outcome.batch.follower_change.additions, IdSet::from([4]));
        assert_eq!(outcome.batch.follower_change.removals, IdSet::from([1]));
        assert!(outcome.batch.followed_change.is_empty());
        assert!(!outcome.screen_name_changed);

        let store = runner.chains().store();
        assert_eq!(
            store.tracked_account(account).unwrap().screen_name.as_deref(),
            Some("tracked")
        );
    }

    #[test]
    fn test_failed_fetch_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let collector = Arc::new(ScriptedCollector::default());
        let runner = runner(&dir, Arc::clone(&collector), Duration::from_secs(5));
        collector.set(1, Side::Follower, &[1]);
        *collector.failing.lock() = Some(Side::Followed);

        let result = runner.run_at(AccountId(1), Timestamp(10), &CancelToken::new());
        match result {
            Err(e @ StoreError::FetchIncomplete { .. }) => assert!(e.is_transient()),
            other => panic!("unexpected result: {:?}", other.map(|o| o.batch.id)),
        }
        assert_eq!(runner.chains().store().stats().batch_count, 0);
    }

    #[test]
    fn test_timeout_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let collector = Arc::new(ScriptedCollector::default());
        *collector.delay.lock() = Some(Duration::from_secs(10));
        let runner = runner(&dir, Arc::clone(&collector), Duration::from_millis(50));

        let started = Instant::now();
        let result = runner.run_at(AccountId(1), Timestamp(10), &CancelToken::new());

        assert!(matches!(result, Err(StoreError::FetchIncomplete { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(runner.chains().store().stats().batch_count, 0);
    }

    #[test]
    fn test_cancel_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let collector = Arc::new(ScriptedCollector::default());
        *collector.delay.lock() = Some(Duration::from_secs(10));
        let runner = runner(&dir, Arc::clone(&collector), Duration::from_secs(30));

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let result = runner.run_at(AccountId(1), Timestamp(10), &cancel);
        handle.join().unwrap();

        match result {
            Err(StoreError::FetchIncomplete { reason, .. }) => assert_eq!(reason, "cancelled"),
            other => panic!("unexpected result: {:?}", other.map(|o| o.batch.id)),
        }
        assert_eq!(runner.chains().store().stats().batch_count, 0);
    }

    #[test]
    fn test_registry_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let collector = Arc::new(ScriptedCollector::default());
        collector.set(2, Side::Follower, &[5]);
        let runner = runner(&dir, collector, Duration::from_secs(5))
            .with_registry(Arc::new(FixedRegistry(Err("registry down".into()))));

        let outcome = runner
            .run_at(AccountId(2), Timestamp(10), &CancelToken::new())
            .unwrap();
        assert!(!outcome.screen_name_changed);
        assert_eq!(runner.chains().store().stats().batch_count, 1);
    }
}
