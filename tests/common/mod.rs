//! Common test utilities and fixtures
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use mail_poller::config::{AccountConfig, Config, PollConfig};
use mail_poller::error::{PollerError, Result};
use mail_poller::models::{Action, Message, Rule};
use mail_poller::provider::{MailSession, SessionFactory};
use mockall::mock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Create a test message with default values
pub fn create_test_message(id: &str, subject: &str) -> Message {
    Message {
        id: id.to_string(),
        thread_id: format!("thread_{}", id),
        subject: subject.to_string(),
        sender: "sender@example.com".to_string(),
        date_received: Utc::now(),
        labels: vec!["INBOX".to_string()],
    }
}

/// Configuration with the given accounts and a single job-opportunity rule
pub fn test_config(accounts: Vec<AccountConfig>, fail_fast: bool) -> Config {
    Config {
        accounts,
        poll: PollConfig {
            interval_secs: 300,
            fail_fast,
            rules: vec![Rule::label("job opportunity", "imp")],
        },
    }
}

pub fn disabled_account(id: &str) -> AccountConfig {
    let mut account = AccountConfig::new(id, format!("{} (disabled)", id));
    account.enabled = false;
    account
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

// Mock implementation of MailSession for testing
mock! {
    pub Session {}

    #[async_trait::async_trait]
    impl MailSession for Session {
        async fn connect(&self) -> Result<()>;
        async fn authenticate(&self) -> Result<()>;
        async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<Message>>;
        async fn apply_action(&self, message_id: &str, action: &Action) -> Result<()>;
        async fn close(&self) -> Result<()>;
    }
}

/// Shared, scriptable mailbox behind every [`FakeSession`] a factory creates
#[derive(Default)]
pub struct FakeMailbox {
    pub created: AtomicUsize,
    pub connects: AtomicUsize,
    pub authenticates: AtomicUsize,
    pub fetches: AtomicUsize,
    pub closes: AtomicUsize,

    pub fail_create: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_authenticate: AtomicBool,
    /// Fetch fails with a provider error that keeps the session
    pub fail_fetch: AtomicBool,
    /// Fetch fails with a connection error that drops the session
    pub fail_fetch_network: AtomicBool,
    pub fail_apply: AtomicBool,
    /// Fetch panics, taking the polling task down with it
    pub panic_fetch: AtomicBool,
    /// How long `authenticate` takes, in milliseconds
    pub authenticate_delay_ms: AtomicU64,

    /// Batches returned by successive fetches; empty once drained
    batches: Mutex<VecDeque<Vec<Message>>>,
    applied: Mutex<Vec<(String, Action)>>,
    since_seen: Mutex<Vec<DateTime<Utc>>>,
}

impl FakeMailbox {
    pub fn push_batch(&self, messages: Vec<Message>) {
        self.batches.lock().unwrap().push_back(messages);
    }

    pub fn applied(&self) -> Vec<(String, Action)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn since_seen(&self) -> Vec<DateTime<Utc>> {
        self.since_seen.lock().unwrap().clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// In-memory session that records every call into its [`FakeMailbox`]
pub struct FakeSession {
    mailbox: Arc<FakeMailbox>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl MailSession for FakeSession {
    async fn connect(&self) -> Result<()> {
        self.mailbox.connects.fetch_add(1, Ordering::SeqCst);
        if self.mailbox.fail_connect.load(Ordering::SeqCst) {
            return Err(PollerError::NetworkError("connection refused".to_string()));
        }
        Ok(())
    }

    async fn authenticate(&self) -> Result<()> {
        self.mailbox.authenticates.fetch_add(1, Ordering::SeqCst);
        let delay = self.mailbox.authenticate_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.mailbox.fail_authenticate.load(Ordering::SeqCst) {
            return Err(PollerError::AuthError("invalid_grant".to_string()));
        }
        Ok(())
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<Message>> {
        self.mailbox.fetches.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(PollerError::NotConnected("session closed".to_string()));
        }
        self.mailbox.since_seen.lock().unwrap().push(since);

        if self.mailbox.panic_fetch.load(Ordering::SeqCst) {
            panic!("mailbox fixture configured to panic on fetch");
        }

        if self.mailbox.fail_fetch_network.load(Ordering::SeqCst) {
            return Err(PollerError::NetworkError("connection reset".to_string()));
        }
        if self.mailbox.fail_fetch.load(Ordering::SeqCst) {
            return Err(PollerError::ApiError("HTTP 418".to_string()));
        }
        Ok(self.mailbox.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    async fn apply_action(&self, message_id: &str, action: &Action) -> Result<()> {
        if self.mailbox.fail_apply.load(Ordering::SeqCst) {
            return Err(PollerError::LabelError("label quota exceeded".to_string()));
        }
        self.mailbox
            .applied
            .lock()
            .unwrap()
            .push((message_id.to_string(), action.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.mailbox.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`FakeSession`]s, one mailbox per account id
#[derive(Default)]
pub struct FakeSessionFactory {
    mailboxes: Mutex<std::collections::HashMap<String, Arc<FakeMailbox>>>,
}

impl FakeSessionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mailbox(&self, account_id: &str) -> Arc<FakeMailbox> {
        Arc::clone(
            self.mailboxes
                .lock()
                .unwrap()
                .entry(account_id.to_string())
                .or_default(),
        )
    }
}

impl SessionFactory for FakeSessionFactory {
    fn create(&self, account: &AccountConfig) -> Result<Arc<dyn MailSession>> {
        let mailbox = self.mailbox(&account.id);
        if mailbox.fail_create.load(Ordering::SeqCst) {
            return Err(PollerError::ConfigError(format!(
                "account {}: credentials need a refresh_token or an access_token",
                account.id
            )));
        }
        mailbox.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            mailbox,
            closed: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_message() {
        let msg = create_test_message("msg1", "Test Subject");
        assert_eq!(msg.id, "msg1");
        assert_eq!(msg.thread_id, "thread_msg1");
        assert_eq!(msg.subject, "Test Subject");
    }

    #[test]
    fn test_factory_shares_mailbox_per_account() {
        let factory = FakeSessionFactory::new();
        let account = AccountConfig::new("primary", "Primary");

        factory.create(&account).unwrap();
        factory.create(&account).unwrap();

        assert_eq!(FakeMailbox::count(&factory.mailbox("primary").created), 2);
        assert_eq!(FakeMailbox::count(&factory.mailbox("other").created), 0);
    }
}
