//! Multi-account polling scheduler
//!
//! The [`Scheduler`] owns one [`AccountState`](crate::account::AccountState)
//! per configured account and runs one polling loop per enabled account on
//! its own tokio task.
//!
//! # Lifecycle
//!
//! - [`Scheduler::start`] spawns the loops and waits for them. It returns
//!   `Ok(())` once every loop has unwound after cancellation or stop, or
//!   the first loop error as soon as it arrives. Remaining loops keep
//!   running until they observe cancellation on their own. A loop task that
//!   panics counts as a failed loop; its account is released and its
//!   session closed.
//! - [`Scheduler::stop`] closes each active account's session, fires its
//!   stop signal and marks it inactive. It can be called from any task
//!   and is idempotent.

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::account::{AccountRegistry, AccountSnapshot};
use crate::config::{AccountConfig, Config};
use crate::error::{PollerError, Result};
use crate::poller::{close_session, AccountPoller, LoopOutcome};
use crate::provider::SessionFactory;

/// Account id and how its loop task ended
type Joined = (String, std::result::Result<Result<LoopOutcome>, JoinError>);

pub struct Scheduler {
    accounts: Vec<AccountConfig>,
    poller: AccountPoller,
    started: AtomicBool,
}

impl Scheduler {
    /// Build a scheduler for a validated configuration
    pub fn new(config: Config, factory: Arc<dyn SessionFactory>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(AccountRegistry::new(&config.accounts));
        let poller = AccountPoller::new(
            registry,
            factory,
            config.poll.rules.clone(),
            config.poll.interval(),
            config.poll.fail_fast,
        );

        Ok(Self {
            accounts: config.accounts,
            poller,
            started: AtomicBool::new(false),
        })
    }

    /// Override the poll interval from the configuration
    pub fn with_interval(mut self, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(PollerError::ConfigError(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        self.poller.set_interval(interval);
        Ok(self)
    }

    pub fn poller(&self) -> &AccountPoller {
        &self.poller
    }

    /// Start one polling loop per enabled account and wait for them.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PollerError::AlreadyStarted);
        }

        let mut enabled = Vec::new();
        for account in &self.accounts {
            if account.enabled {
                enabled.push(account.clone());
            } else {
                info!("Account {} ({}) is disabled, skipping", account.id, account.name);
            }
        }

        if enabled.is_empty() {
            warn!("No enabled accounts, nothing to poll");
            return Ok(());
        }

        info!("Starting {} polling loop(s)", enabled.len());
        let mut loops = FuturesUnordered::new();

        for account in enabled {
            let poller = self.poller.clone();
            let cancel = cancel.clone();
            let account_id = account.id.clone();
            let span = info_span!("account", id = %account.id);

            let handle = tokio::spawn(async move { poller.run(&account, &cancel).await }.instrument(span));
            loops.push(async move { (account_id, handle.await) });
        }

        let registry = Arc::clone(self.poller.registry());
        while let Some((account_id, joined)) = loops.next().await {
            match settle(&registry, &account_id, joined).await {
                Ok(outcome) => {
                    info!(account = %account_id, ?outcome, "Polling loop finished");
                }
                Err(e) => {
                    error!(account = %account_id, "Polling loop failed: {}", e);
                    tokio::spawn(drain_outcomes(registry, loops));
                    return Err(PollerError::AccountFailed {
                        account_id,
                        source: Box::new(e),
                    });
                }
            }
        }

        info!("All polling loops finished");
        Ok(())
    }

    /// Stop every active account: close its session, fire its stop signal,
    /// mark it inactive. Accounts that are not active are left alone.
    pub async fn stop(&self) {
        for account in &self.accounts {
            if let Err(e) = self.stop_account(&account.id).await {
                warn!(account = %account.id, "Failed to stop account: {}", e);
            }
        }
    }

    /// Stop a single account. Returns false if it was not active.
    pub async fn stop_account(&self, account_id: &str) -> Result<bool> {
        match self.poller.registry().stop(account_id).await? {
            Some(session) => {
                if let Some(session) = session {
                    close_session(account_id, session).await;
                }
                info!(account = %account_id, "Stopped polling");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current state of every configured account, in configuration order
    pub async fn snapshot(&self) -> Vec<AccountSnapshot> {
        let registry = self.poller.registry();
        let mut snapshots = Vec::with_capacity(self.accounts.len());
        for account in &self.accounts {
            if let Ok(snapshot) = registry.snapshot(&account.id).await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }
}

/// Turn a joined loop task into its outcome.
///
/// A task that panicked never ran its own cleanup, so the account is
/// released and its session closed here.
async fn settle(
    registry: &AccountRegistry,
    account_id: &str,
    joined: std::result::Result<Result<LoopOutcome>, JoinError>,
) -> Result<LoopOutcome> {
    match joined {
        Ok(result) => result,
        Err(e) => {
            match registry.stop(account_id).await {
                Ok(Some(Some(session))) => close_session(account_id, session).await,
                Ok(_) => {}
                Err(release_err) => warn!(account = %account_id, "Failed to release account: {}", release_err),
            }
            Err(PollerError::LoopAborted(e.to_string()))
        }
    }
}

/// Log the outcomes of loops still running after `start` returned an error
async fn drain_outcomes<S>(registry: Arc<AccountRegistry>, mut loops: S)
where
    S: Stream<Item = Joined> + Unpin,
{
    while let Some((account_id, joined)) = loops.next().await {
        match settle(&registry, &account_id, joined).await {
            Ok(outcome) => info!(account = %account_id, ?outcome, "Polling loop finished"),
            Err(e) => error!(account = %account_id, "Polling loop failed: {}", e),
        }
    }
}
