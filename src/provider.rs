//! Provider session capability used by the polling core
//!
//! The scheduler only talks to mail providers through [`MailSession`]. A
//! [`SessionFactory`] turns an account's configuration into a fresh,
//! not-yet-connected session; the polling loop then drives `connect` and
//! `authenticate` before the first fetch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::AccountConfig;
use crate::error::Result;
use crate::models::{Action, Message};

/// Authenticated, reusable handle to one account's mailbox
#[async_trait]
pub trait MailSession: Send + Sync {
    /// Establish the transport to the provider
    async fn connect(&self) -> Result<()>;

    /// Authenticate the connected transport
    async fn authenticate(&self) -> Result<()>;

    /// Fetch every message the provider has observed since `since`
    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<Message>>;

    /// Apply one action to one message
    async fn apply_action(&self, message_id: &str, action: &Action) -> Result<()>;

    /// Release the connection. Later calls fail with `NotConnected`.
    async fn close(&self) -> Result<()>;
}

/// Creates provider sessions for configured accounts
pub trait SessionFactory: Send + Sync {
    fn create(&self, account: &AccountConfig) -> Result<Arc<dyn MailSession>>;
}
