//! Multi-account mail poller
//!
//! Periodically polls a set of configured mail accounts, evaluates
//! subject-matching rules against newly arrived messages and applies the
//! resulting labels.
//!
//! # Overview
//!
//! - **Accounts**: per-account state with at most one active poller each
//! - **Polling**: one loop per enabled account on its own task, a poll
//!   immediately on start and then once per interval
//! - **Rules**: case-insensitive subject-substring matching that yields
//!   label actions
//! - **Providers**: mail access behind the [`MailSession`] capability, with
//!   a Gmail implementation
//!
//! # Example Usage
//!
//! ```no_run
//! use mail_poller::{config::Config, gmail::GmailSessionFactory, scheduler::Scheduler};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let scheduler = Scheduler::new(config, Arc::new(GmailSessionFactory))?;
//!
//!     let cancel = CancellationToken::new();
//!     scheduler.start(cancel).await?;
//!     scheduler.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`account`] - Per-account state registry
//! - [`auth`] - OAuth2 authentication and Gmail API initialization
//! - [`cli`] - Command-line interface
//! - [`config`] - Configuration management
//! - [`error`] - Error types and result aliases
//! - [`gmail`] - Gmail session with retry logic
//! - [`models`] - Core data structures
//! - [`poller`] - Per-account polling loop and poll cycle
//! - [`provider`] - Mail session capability
//! - [`rules`] - Rule evaluation
//! - [`scheduler`] - Multi-account scheduler

pub mod account;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gmail;
pub mod models;
pub mod poller;
pub mod provider;
pub mod rules;
pub mod scheduler;

// Re-export commonly used types for convenience
pub use error::{PollerError, Result};

// Core data models
pub use models::{Action, ActionKind, Message, Rule};

// Config types
pub use config::{AccountConfig, AccountCredentials, Config, PollConfig, ProviderKind};

// Provider capability
pub use provider::{MailSession, SessionFactory};

// Polling
pub use account::{AccountRegistry, AccountSnapshot};
pub use poller::{AccountPoller, CycleReport, LoopOutcome};
pub use scheduler::Scheduler;

// CLI types (for binary usage)
pub use cli::{Cli, Commands};
