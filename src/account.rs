//! Per-account lifecycle state
//!
//! Every configured account gets exactly one [`AccountState`], created when
//! the registry is built and kept for the life of the process. Each state
//! sits behind its own lock so accounts never contend with each other. The
//! lock is only held for field reads and writes, never across provider I/O.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::AccountConfig;
use crate::error::{PollerError, Result};
use crate::provider::MailSession;

/// Mutable state for one account
pub struct AccountState {
    name: String,
    enabled: bool,
    last_sync: DateTime<Utc>,
    is_active: bool,
    /// Bumped on every successful activation so a finished loop can't
    /// clear the flag of a newer one
    generation: u64,
    stop: CancellationToken,
    session: Option<Arc<dyn MailSession>>,
}

impl AccountState {
    fn new(config: &AccountConfig) -> Self {
        Self {
            name: config.name.clone(),
            enabled: config.enabled,
            last_sync: DateTime::<Utc>::UNIX_EPOCH,
            is_active: false,
            generation: 0,
            stop: CancellationToken::new(),
            session: None,
        }
    }
}

/// Proof that the caller won the activation of an account
#[derive(Debug, Clone)]
pub struct Activation {
    pub account_id: String,
    pub generation: u64,
    pub stop: CancellationToken,
}

/// Read-only view of one account's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub is_active: bool,
    pub last_sync: DateTime<Utc>,
    pub has_session: bool,
}

/// Arena of account states keyed by account id
pub struct AccountRegistry {
    states: HashMap<String, Arc<Mutex<AccountState>>>,
}

impl AccountRegistry {
    pub fn new(accounts: &[AccountConfig]) -> Self {
        let states = accounts
            .iter()
            .map(|a| (a.id.clone(), Arc::new(Mutex::new(AccountState::new(a)))))
            .collect();
        Self { states }
    }

    fn state(&self, account_id: &str) -> Result<&Arc<Mutex<AccountState>>> {
        self.states
            .get(account_id)
            .ok_or_else(|| PollerError::UnknownAccount(account_id.to_string()))
    }

    pub fn contains(&self, account_id: &str) -> bool {
        self.states.contains_key(account_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    /// Atomically flip `is_active` from false to true.
    ///
    /// Fails with `AlreadyPolling` and leaves the state untouched if a loop
    /// already owns the account.
    pub async fn try_activate(&self, account_id: &str) -> Result<Activation> {
        let mut state = self.state(account_id)?.lock().await;
        if state.is_active {
            return Err(PollerError::AlreadyPolling {
                account_id: account_id.to_string(),
            });
        }

        state.is_active = true;
        state.generation += 1;
        debug!(account = %account_id, generation = state.generation, "account activated");

        Ok(Activation {
            account_id: account_id.to_string(),
            generation: state.generation,
            stop: state.stop.clone(),
        })
    }

    /// End an activation. Returns the session it still held, if any, so the
    /// caller can close it outside the lock.
    pub async fn deactivate(&self, activation: &Activation) -> Result<Option<Arc<dyn MailSession>>> {
        let mut state = self.state(&activation.account_id)?.lock().await;
        if state.generation != activation.generation {
            return Ok(None);
        }
        state.is_active = false;
        Ok(state.session.take())
    }

    /// Request the account's loop to stop.
    ///
    /// Returns `None` when the account is not active (no-op), otherwise the
    /// session that was taken from the state.
    pub async fn stop(&self, account_id: &str) -> Result<Option<Option<Arc<dyn MailSession>>>> {
        let mut state = self.state(account_id)?.lock().await;
        if !state.is_active {
            return Ok(None);
        }
        state.stop.cancel();
        state.is_active = false;
        Ok(Some(state.session.take()))
    }

    pub async fn last_sync(&self, account_id: &str) -> Result<DateTime<Utc>> {
        Ok(self.state(account_id)?.lock().await.last_sync)
    }

    /// Move `last_sync` forward; never moves it back
    pub async fn advance_last_sync(&self, account_id: &str, to: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let mut state = self.state(account_id)?.lock().await;
        if to > state.last_sync {
            state.last_sync = to;
        }
        Ok(state.last_sync)
    }

    pub async fn session(&self, account_id: &str) -> Result<Option<Arc<dyn MailSession>>> {
        Ok(self.state(account_id)?.lock().await.session.clone())
    }

    /// Store a freshly authenticated session for the activation.
    ///
    /// Hands the session back as `Err` if the activation is no longer
    /// current (stopped or superseded) so the caller can close it.
    pub async fn store_session(
        &self,
        activation: &Activation,
        session: Arc<dyn MailSession>,
    ) -> Result<std::result::Result<(), Arc<dyn MailSession>>> {
        let mut state = self.state(&activation.account_id)?.lock().await;
        if !state.is_active || state.generation != activation.generation || state.stop.is_cancelled() {
            return Ok(Err(session));
        }
        state.session = Some(session);
        Ok(Ok(()))
    }

    /// Drop the stored session if it is still `session`. Returns true if it was removed.
    pub async fn discard_session(&self, account_id: &str, session: &Arc<dyn MailSession>) -> Result<bool> {
        let mut state = self.state(account_id)?.lock().await;
        match &state.session {
            Some(current) if Arc::ptr_eq(current, session) => {
                state.session = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn snapshot(&self, account_id: &str) -> Result<AccountSnapshot> {
        let state = self.state(account_id)?.lock().await;
        Ok(AccountSnapshot {
            id: account_id.to_string(),
            name: state.name.clone(),
            enabled: state.enabled,
            is_active: state.is_active,
            last_sync: state.last_sync,
            has_session: state.session.is_some(),
        })
    }
}
