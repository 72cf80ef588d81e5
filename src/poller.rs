//! Per-account polling loop and the single poll cycle it runs

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{AccountRegistry, Activation};
use crate::config::AccountConfig;
use crate::error::{PollerError, Result};
use crate::models::{Message, Rule};
use crate::provider::{MailSession, SessionFactory};
use crate::rules;

/// How a polling loop ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The account's own stop signal fired
    Stopped,
    /// The process-wide cancellation token fired
    Cancelled,
}

/// Counters for one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub matched: usize,
    pub applied: usize,
    pub failed: usize,
    /// `last_sync` after the cycle
    pub last_sync: DateTime<Utc>,
}

/// Runs polling loops against a shared account registry
#[derive(Clone)]
pub struct AccountPoller {
    registry: Arc<AccountRegistry>,
    factory: Arc<dyn SessionFactory>,
    rules: Arc<Vec<Rule>>,
    interval: Duration,
    fail_fast: bool,
}

impl AccountPoller {
    pub fn new(
        registry: Arc<AccountRegistry>,
        factory: Arc<dyn SessionFactory>,
        rules: Vec<Rule>,
        interval: Duration,
        fail_fast: bool,
    ) -> Self {
        Self {
            registry,
            factory,
            rules: Arc::new(rules),
            interval,
            fail_fast,
        }
    }

    pub fn registry(&self) -> &Arc<AccountRegistry> {
        &self.registry
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub(crate) fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Run the polling loop for one account until it is stopped or cancelled.
    ///
    /// Fails immediately, without any I/O, if another loop already owns the
    /// account.
    pub async fn run(&self, account: &AccountConfig, cancel: &CancellationToken) -> Result<LoopOutcome> {
        if self.interval.is_zero() {
            return Err(PollerError::ConfigError(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        let activation = self.registry.try_activate(&account.id).await?;
        info!(account = %account.id, "Polling started (every {:?})", self.interval);

        let outcome = self.run_active(account, &activation, cancel).await;

        if let Some(session) = self.registry.deactivate(&activation).await? {
            close_session(&account.id, session).await;
        }
        outcome
    }

    async fn run_active(
        &self,
        account: &AccountConfig,
        activation: &Activation,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome> {
        if let Err(e) = self.poll(account, activation).await {
            // A stop or cancel that raced the initial poll wins over its error
            if activation.stop.is_cancelled() {
                info!(account = %account.id, "Polling stopped during initial poll");
                return Ok(LoopOutcome::Stopped);
            }
            if cancel.is_cancelled() {
                info!(account = %account.id, "Polling cancelled during initial poll");
                return Ok(LoopOutcome::Cancelled);
            }
            if self.fail_fast {
                return Err(e);
            }
            warn!(account = %account.id, "Initial poll failed: {}", e);
        }

        // First tick one interval from now; the initial poll already ran
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(account = %account.id, "Polling cancelled");
                    return Ok(LoopOutcome::Cancelled);
                }
                _ = activation.stop.cancelled() => {
                    info!(account = %account.id, "Polling stopped");
                    return Ok(LoopOutcome::Stopped);
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll(account, activation).await {
                        warn!(account = %account.id, "Poll failed: {}", e);
                    }
                }
            }
        }
    }

    /// Run one fetch-evaluate-act cycle for an account
    pub async fn poll(&self, account: &AccountConfig, activation: &Activation) -> Result<CycleReport> {
        let since = self.registry.last_sync(&account.id).await?;

        let session = match self.registry.session(&account.id).await? {
            Some(session) => session,
            None => self.open_session(account, activation).await?,
        };

        let messages = match session.fetch_since(since).await {
            Ok(messages) => messages,
            Err(e) => {
                if e.is_session_fatal() && self.registry.discard_session(&account.id, &session).await? {
                    debug!(account = %account.id, "Discarding session after: {}", e);
                    close_session(&account.id, session).await;
                }
                return Err(e);
            }
        };

        let mut report = apply_rules(session.as_ref(), &messages, &self.rules).await;
        report.last_sync = self.registry.advance_last_sync(&account.id, Utc::now()).await?;

        info!(
            account = %account.id,
            fetched = report.fetched,
            applied = report.applied,
            failed = report.failed,
            "Poll complete"
        );
        Ok(report)
    }

    async fn open_session(&self, account: &AccountConfig, activation: &Activation) -> Result<Arc<dyn MailSession>> {
        debug!(account = %account.id, provider = %account.provider, "Opening session");
        let session = self.factory.create(account)?;

        session.connect().await?;
        if let Err(e) = session.authenticate().await {
            close_session(&account.id, session).await;
            return Err(e);
        }

        match self.registry.store_session(activation, Arc::clone(&session)).await? {
            Ok(()) => Ok(session),
            Err(session) => {
                close_session(&account.id, session).await;
                Err(PollerError::NotConnected(format!(
                    "account {} stopped while its session was opening",
                    account.id
                )))
            }
        }
    }
}

/// Evaluate every rule against every message and apply the matches.
///
/// Messages are handled in the order given, rules in declaration order. A
/// failed action is logged and counted; it does not stop the rest.
pub async fn apply_rules(session: &dyn MailSession, messages: &[Message], rules: &[Rule]) -> CycleReport {
    let mut report = CycleReport {
        fetched: messages.len(),
        ..Default::default()
    };

    for message in messages {
        for matched in rules::evaluate(message, rules) {
            report.matched += 1;
            match session.apply_action(&message.id, &matched.action).await {
                Ok(()) => {
                    report.applied += 1;
                    info!(
                        "Applied {} to message {} with subject: {}",
                        matched.action, message.id, message.subject
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to apply {} to message {}: {}", matched.action, message.id, e);
                }
            }
        }
    }

    report
}

/// Close a session, logging instead of propagating failures
pub(crate) async fn close_session(account_id: &str, session: Arc<dyn MailSession>) {
    if let Err(e) = session.close().await {
        warn!(account = %account_id, "Error closing session: {}", e);
    }
}
