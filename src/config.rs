use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{PollerError, Result};
use crate::models::Rule;

/// Prefix for per-account credential environment variables
pub const ENV_PREFIX: &str = "MAIL_POLLER";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_accounts")]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub poll: PollConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accounts: default_accounts(),
            poll: PollConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gmail,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Gmail => write!(f, "gmail"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub credentials: AccountCredentials,
}

impl AccountConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: default_provider(),
            enabled: default_enabled(),
            credentials: AccountCredentials::default(),
        }
    }
}

/// OAuth2 credentials for one account
///
/// Either a refresh token (preferred, refreshed automatically) or a bare
/// access token must be available once environment overrides are applied.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AccountCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl AccountCredentials {
    /// Fill missing fields from `MAIL_POLLER_<ACCOUNT>_<FIELD>` environment variables
    pub fn with_env_overrides(mut self, account_id: &str) -> Self {
        let lookup = |field: &str| std::env::var(env_var_name(account_id, field)).ok();

        self.client_id = self.client_id.or_else(|| lookup("CLIENT_ID"));
        self.client_secret = self.client_secret.or_else(|| lookup("CLIENT_SECRET"));
        self.refresh_token = self.refresh_token.or_else(|| lookup("REFRESH_TOKEN"));
        self.access_token = self.access_token.or_else(|| lookup("ACCESS_TOKEN"));
        self
    }
}

/// Environment variable name for one credential field of an account
pub fn env_var_name(account_id: &str, field: &str) -> String {
    let account: String = account_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}_{}", ENV_PREFIX, account, field)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Escalate a failure of the first poll of a loop to the scheduler
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_rules")]
    pub rules: Vec<Rule>,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            fail_fast: false,
            rules: default_rules(),
        }
    }
}

fn default_accounts() -> Vec<AccountConfig> {
    vec![AccountConfig::new("primary", "Primary Gmail")]
}

fn default_provider() -> ProviderKind {
    ProviderKind::Gmail
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

fn default_rules() -> Vec<Rule> {
    vec![Rule::label("job opportunity", "imp")]
}

const MAX_INTERVAL_SECS: u64 = 86_400;

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PollerError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| PollerError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!(
            "Loaded configuration from {:?} ({} accounts, {} rules)",
            path,
            config.accounts.len(),
            config.poll.rules.len()
        );
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PollerError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PollerError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| PollerError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            return Err(PollerError::ConfigError(
                "at least one account must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                return Err(PollerError::ConfigError(
                    "accounts.id cannot be empty".to_string(),
                ));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(PollerError::ConfigError(format!(
                    "duplicate account id '{}'",
                    account.id
                )));
            }
        }

        if self.poll.interval_secs == 0 {
            return Err(PollerError::ConfigError(
                "poll.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.poll.interval_secs > MAX_INTERVAL_SECS {
            return Err(PollerError::ConfigError(format!(
                "poll.interval_secs cannot exceed {} (1 day)",
                MAX_INTERVAL_SECS
            )));
        }

        for (i, rule) in self.poll.rules.iter().enumerate() {
            if rule.label.trim().is_empty() {
                return Err(PollerError::ConfigError(format!(
                    "poll.rules[{}].label cannot be empty",
                    i
                )));
            }
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
