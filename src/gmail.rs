//! Gmail provider session with retry logic and label resolution

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use google_gmail1::api::{Label, Message as GmailMessage, ModifyMessageRequest};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::auth::{self, GmailHub, HttpsConnector};
use crate::config::{AccountConfig, AccountCredentials, ProviderKind};
use crate::error::{PollerError, Result};
use crate::models::{Action, Message};
use crate::provider::{MailSession, SessionFactory};

const MODIFY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";
const LABELS_SCOPE: &str = "https://www.googleapis.com/auth/gmail.labels";

/// Concurrent metadata requests per fetch
const FETCH_CONCURRENCY: usize = 10;

const API_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Longest server-requested wait honoured on a rate limit
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Session against one Gmail mailbox
///
/// `connect` prepares the TLS transport, `authenticate` obtains a token and
/// builds the API hub. Label ids are resolved lazily and cached per session.
pub struct GmailSession {
    account_id: String,
    credentials: AccountCredentials,
    connector: Mutex<Option<HttpsConnector>>,
    hub: RwLock<Option<Arc<GmailHub>>>,
    /// lowercase label name -> label id, `None` until first loaded
    labels: Mutex<Option<HashMap<String, String>>>,
}

impl GmailSession {
    pub fn new(account_id: impl Into<String>, credentials: AccountCredentials) -> Self {
        Self {
            account_id: account_id.into(),
            credentials,
            connector: Mutex::new(None),
            hub: RwLock::new(None),
            labels: Mutex::new(None),
        }
    }

    async fn hub(&self) -> Result<Arc<GmailHub>> {
        self.hub.read().await.clone().ok_or_else(|| {
            PollerError::NotConnected(format!("Gmail session for {} is not authenticated", self.account_id))
        })
    }

    /// Run `operation`, retrying transient failures up to `max_retries` times
    async fn with_retry<T, F, Fut>(operation_name: &str, max_retries: u32, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut retries = 0;

        loop {
            match operation().await {
                Err(e) if e.is_transient() && retries < max_retries => {
                    let delay = retry_delay(&e, retries);
                    retries += 1;
                    warn!(
                        operation = operation_name,
                        retry = retries,
                        "Transient failure: {}. Retrying in {:?}",
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// Run an API call with a timeout so a stalled connection can't hang the loop
    async fn with_timeout<T, Fut>(operation_name: &str, call: Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(API_TIMEOUT, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Gmail API {} call timed out after {:?}", operation_name, API_TIMEOUT);
                Err(PollerError::NetworkError(format!(
                    "API call timed out after {:?}",
                    API_TIMEOUT
                )))
            }
        }
    }

    async fn list_message_ids(hub: &GmailHub, query: &str) -> Result<Vec<String>> {
        let mut all_ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = page_token.clone();
            let (_, response) = Self::with_retry("list_messages", 3, || {
                let token = token.clone();
                async move {
                    let mut call = hub.users().messages_list("me").q(query).max_results(100);
                    if let Some(token) = token.as_ref() {
                        call = call.page_token(token);
                    }
                    Self::with_timeout("list_messages", async {
                        call.add_scope(MODIFY_SCOPE).doit().await.map_err(PollerError::from)
                    })
                    .await
                }
            })
            .await?;

            all_ids.extend(
                response
                    .messages
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| m.id),
            );

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(all_ids)
    }

    async fn fetch_message(hub: &GmailHub, id: &str) -> Result<Message> {
        Self::with_retry("get_message", 3, || async move {
            let (_, msg) = Self::with_timeout("get_message", async {
                hub.users()
                    .messages_get("me", id)
                    .format("metadata")
                    .add_metadata_headers("From")
                    .add_metadata_headers("Subject")
                    .add_metadata_headers("Date")
                    .add_scope(MODIFY_SCOPE)
                    .doit()
                    .await
                    .map_err(PollerError::from)
            })
            .await?;
            parse_message(msg)
        })
        .await
    }

    /// Resolve a label name to its id, creating the label if it doesn't exist.
    /// Lookups are case-insensitive, matching how Gmail treats label names.
    async fn resolve_label(&self, hub: &GmailHub, name: &str) -> Result<String> {
        let mut guard = self.labels.lock().await;

        if guard.is_none() {
            let (_, response) = Self::with_retry("list_labels", 3, || async move {
                Self::with_timeout("list_labels", async {
                    hub.users()
                        .labels_list("me")
                        .add_scope(LABELS_SCOPE)
                        .doit()
                        .await
                        .map_err(PollerError::from)
                })
                .await
            })
            .await?;

            let cache: HashMap<String, String> = response
                .labels
                .unwrap_or_default()
                .into_iter()
                .filter_map(|label| match (label.id, label.name) {
                    (Some(id), Some(name)) => Some((name.to_lowercase(), id)),
                    _ => None,
                })
                .collect();
            debug!("Loaded {} existing labels into cache", cache.len());
            *guard = Some(cache);
        }

        let cache = guard.get_or_insert_with(HashMap::new);
        if let Some(id) = cache.get(&name.to_lowercase()) {
            return Ok(id.clone());
        }

        info!(account = %self.account_id, "Creating label: {}", name);
        let id = Self::with_retry("create_label", 3, || async move {
            let label = Label {
                name: Some(name.to_string()),
                message_list_visibility: Some("show".to_string()),
                label_list_visibility: Some("labelShow".to_string()),
                ..Default::default()
            };

            let (_, created) = hub
                .users()
                .labels_create(label, "me")
                .add_scope(LABELS_SCOPE)
                .doit()
                .await?;

            created
                .id
                .ok_or_else(|| PollerError::LabelError("Created label has no ID".to_string()))
        })
        .await
        .map_err(|e| PollerError::LabelError(format!("Failed to create label '{}': {}", name, e)))?;

        cache.insert(name.to_lowercase(), id.clone());
        Ok(id)
    }
}

#[async_trait]
impl MailSession for GmailSession {
    async fn connect(&self) -> Result<()> {
        let connector = auth::build_connector()?;
        *self.connector.lock().await = Some(connector);
        debug!(account = %self.account_id, "Gmail transport ready");
        Ok(())
    }

    async fn authenticate(&self) -> Result<()> {
        let connector = self.connector.lock().await.clone().ok_or_else(|| {
            PollerError::NotConnected(format!("Gmail session for {} is not connected", self.account_id))
        })?;

        let hub = auth::initialize_gmail_hub(connector, &self.credentials).await?;
        *self.hub.write().await = Some(Arc::new(hub));
        info!(account = %self.account_id, "Authenticated with Gmail API");
        Ok(())
    }

    async fn fetch_since(&self, since: DateTime<Utc>) -> Result<Vec<Message>> {
        let hub = self.hub().await?;
        let query = inbox_query(since);
        debug!(account = %self.account_id, "Listing messages with query '{}'", query);

        let ids = Self::list_message_ids(&hub, &query).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // buffered (not buffer_unordered) keeps the provider's ordering
        let hub: &GmailHub = &hub;
        let fetched: Vec<(String, Result<Message>)> = stream::iter(ids)
            .map(move |id| async move {
                let result = Self::fetch_message(hub, &id).await;
                (id, result)
            })
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;

        keep_fetched(&self.account_id, fetched)
    }

    async fn apply_action(&self, message_id: &str, action: &Action) -> Result<()> {
        let hub = self.hub().await?;

        match action {
            Action::Label(name) => {
                let label_id = self.resolve_label(&hub, name).await?;
                let label_id = label_id.as_str();
                let hub: &GmailHub = &hub;

                Self::with_retry("apply_label", 3, || async move {
                    let request = ModifyMessageRequest {
                        add_label_ids: Some(vec![label_id.to_string()]),
                        remove_label_ids: None,
                    };

                    hub.users()
                        .messages_modify(request, "me", message_id)
                        .add_scope(MODIFY_SCOPE)
                        .doit()
                        .await
                        .map(|_| ())
                        .map_err(PollerError::from)
                })
                .await
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.hub.write().await.take();
        self.connector.lock().await.take();
        self.labels.lock().await.take();
        debug!(account = %self.account_id, "Gmail session closed");
        Ok(())
    }
}

/// Creates [`GmailSession`]s from account configuration
#[derive(Debug, Clone, Default)]
pub struct GmailSessionFactory;

impl SessionFactory for GmailSessionFactory {
    fn create(&self, account: &AccountConfig) -> Result<Arc<dyn MailSession>> {
        match account.provider {
            ProviderKind::Gmail => {
                let credentials = account.credentials.clone().with_env_overrides(&account.id);
                auth::check_credentials(&credentials).map_err(|e| {
                    PollerError::ConfigError(format!("account {}: {}", account.id, e))
                })?;
                Ok(Arc::new(GmailSession::new(account.id.clone(), credentials)))
            }
        }
    }
}

/// Delay before the next attempt: the server's `Retry-After` on a rate
/// limit, otherwise exponential backoff starting at one second
fn retry_delay(error: &PollerError, retries: u32) -> Duration {
    match error {
        PollerError::RateLimitExceeded { retry_after } => {
            Duration::from_secs(*retry_after).min(MAX_RETRY_AFTER)
        }
        _ => Duration::from_secs(1u64 << retries.min(5)).min(MAX_BACKOFF),
    }
}

/// Keep the fetched messages, skipping ones that vanished or can't be parsed.
///
/// Any other failure fails the whole fetch so `last_sync` stays put.
fn keep_fetched(account_id: &str, fetched: Vec<(String, Result<Message>)>) -> Result<Vec<Message>> {
    let mut messages = Vec::with_capacity(fetched.len());
    for (id, result) in fetched {
        match result {
            Ok(message) => messages.push(message),
            Err(e @ (PollerError::InvalidMessageFormat(_) | PollerError::MessageNotFound(_))) => {
                warn!(account = %account_id, "Skipping message {}: {}", id, e);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(messages)
}

/// Gmail search query for inbox messages newer than `since`
fn inbox_query(since: DateTime<Utc>) -> String {
    if since <= DateTime::<Utc>::UNIX_EPOCH {
        "in:inbox".to_string()
    } else {
        format!("in:inbox after:{}", since.timestamp())
    }
}

/// Parse a Gmail API message into our Message structure
fn parse_message(msg: GmailMessage) -> Result<Message> {
    let id = msg
        .id
        .ok_or_else(|| PollerError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let thread_id = msg.thread_id.unwrap_or_default();
    let labels = msg.label_ids.unwrap_or_default();

    let headers = msg
        .payload
        .and_then(|p| p.headers)
        .ok_or_else(|| PollerError::InvalidMessageFormat("Missing headers".to_string()))?;

    let mut sender = String::new();
    let mut subject = String::new();
    let mut date_str = String::new();

    for header in headers {
        if let (Some(name), Some(value)) = (header.name, header.value) {
            match name.to_lowercase().as_str() {
                "from" => {
                    sender = match parse_email_header(&value) {
                        Some((_, email)) => email,
                        None => value,
                    };
                }
                "subject" => subject = value,
                "date" => date_str = value,
                _ => {}
            }
        }
    }

    let date_received = parse_date(&date_str).unwrap_or_else(|_| Utc::now());

    Ok(Message {
        id,
        thread_id,
        subject,
        sender,
        date_received,
        labels,
    })
}

/// Parse email header in "Name <email@example.com>" format
fn parse_email_header(header: &str) -> Option<(String, String)> {
    let start = header.find('<')?;
    let end = header.find('>')?;
    if end <= start {
        return None;
    }
    let name = header[..start].trim().trim_matches('"').to_string();
    let email = header[start + 1..end].trim().to_string();
    Some((name, email))
}

/// Parse RFC 2822 date string
fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(date_str)
        .or_else(|_| DateTime::parse_from_rfc3339(date_str))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PollerError::InvalidMessageFormat(format!("Invalid date format: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::{MessagePart, MessagePartHeader};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn header(name: &str, value: &str) -> MessagePartHeader {
        MessagePartHeader {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    fn gmail_message(headers: Vec<MessagePartHeader>) -> GmailMessage {
        GmailMessage {
            id: Some("msg1".to_string()),
            thread_id: Some("thread1".to_string()),
            label_ids: Some(vec!["INBOX".to_string(), "UNREAD".to_string()]),
            payload: Some(MessagePart {
                headers: Some(headers),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_inbox_query() {
        assert_eq!(inbox_query(DateTime::<Utc>::UNIX_EPOCH), "in:inbox");

        let since = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(inbox_query(since), "in:inbox after:1700000000");
    }

    #[test]
    fn test_parse_message() {
        let msg = gmail_message(vec![
            header("From", "\"Acme Recruiting\" <jobs@acme.com>"),
            header("Subject", "Job Opportunity at Acme"),
            header("Date", "Mon, 24 Nov 2025 10:30:00 +0000"),
        ]);

        let parsed = parse_message(msg).unwrap();
        assert_eq!(parsed.id, "msg1");
        assert_eq!(parsed.thread_id, "thread1");
        assert_eq!(parsed.sender, "jobs@acme.com");
        assert_eq!(parsed.subject, "Job Opportunity at Acme");
        assert_eq!(parsed.labels, vec!["INBOX", "UNREAD"]);
        assert_eq!(parsed.date_received.timestamp(), 1_763_980_200);
    }

    #[test]
    fn test_parse_message_missing_id() {
        let mut msg = gmail_message(vec![header("Subject", "hi")]);
        msg.id = None;
        assert!(matches!(
            parse_message(msg),
            Err(PollerError::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn test_parse_message_missing_headers() {
        let mut msg = gmail_message(vec![]);
        msg.payload = None;
        assert!(parse_message(msg).is_err());
    }

    #[test]
    fn test_parse_email_header() {
        let result = parse_email_header("John Doe <john@example.com>");
        assert_eq!(result, Some(("John Doe".to_string(), "john@example.com".to_string())));

        let result = parse_email_header("\"Jane Smith\" <jane@example.com>");
        assert_eq!(result, Some(("Jane Smith".to_string(), "jane@example.com".to_string())));

        assert_eq!(parse_email_header("plain@example.com"), None);
        assert_eq!(parse_email_header("broken > <"), None);
    }

    #[test]
    fn test_parse_date() {
        assert!(parse_date("Mon, 24 Nov 2025 10:30:00 +0000").is_ok());
        assert!(parse_date("2025-11-24T10:30:00Z").is_ok());
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn test_factory_rejects_missing_credentials() {
        let account = AccountConfig::new("no-creds-account", "No creds");
        let result = GmailSessionFactory.create(&account);
        match result {
            Err(PollerError::ConfigError(msg)) => assert!(msg.contains("no-creds-account")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[test]
    fn test_factory_accepts_access_token() {
        let mut account = AccountConfig::new("token-account", "Token");
        account.credentials.access_token = Some("ya29.token".to_string());
        assert!(GmailSessionFactory.create(&account).is_ok());
    }

    #[tokio::test]
    async fn test_session_requires_authentication() {
        let session = GmailSession::new("primary", AccountCredentials::default());

        let fetch = session.fetch_since(Utc::now()).await;
        assert!(matches!(fetch, Err(PollerError::NotConnected(_))));

        let apply = session
            .apply_action("msg1", &Action::Label("imp".to_string()))
            .await;
        assert!(matches!(apply, Err(PollerError::NotConnected(_))));

        // authenticate before connect is rejected too
        let auth = session.authenticate().await;
        assert!(matches!(auth, Err(PollerError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = GmailSession::new("primary", AccountCredentials::default());
        assert!(session.close().await.is_ok());
        assert!(session.close().await.is_ok());
        assert!(matches!(
            session.fetch_since(Utc::now()).await,
            Err(PollerError::NotConnected(_))
        ));
    }

    #[test]
    fn test_retry_delay_backs_off() {
        let network = PollerError::NetworkError("connection reset".to_string());
        assert_eq!(retry_delay(&network, 0), Duration::from_secs(1));
        assert_eq!(retry_delay(&network, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(&network, 2), Duration::from_secs(4));
        assert_eq!(retry_delay(&network, 10), MAX_BACKOFF);
    }

    #[test]
    fn test_retry_delay_honours_retry_after() {
        let limited = PollerError::RateLimitExceeded { retry_after: 7 };
        assert_eq!(retry_delay(&limited, 0), Duration::from_secs(7));
        assert_eq!(retry_delay(&limited, 3), Duration::from_secs(7));

        let long = PollerError::RateLimitExceeded { retry_after: 3600 };
        assert_eq!(retry_delay(&long, 0), MAX_RETRY_AFTER);
    }

    #[test]
    fn test_keep_fetched_skips_unparseable_messages() {
        let good = |id: &str| Message {
            id: id.to_string(),
            thread_id: String::new(),
            subject: "Job opportunity".to_string(),
            sender: "jobs@acme.com".to_string(),
            date_received: Utc::now(),
            labels: Vec::new(),
        };

        let fetched = vec![
            ("m1".to_string(), Ok(good("m1"))),
            (
                "m2".to_string(),
                Err(PollerError::InvalidMessageFormat("Missing headers".to_string())),
            ),
            (
                "m3".to_string(),
                Err(PollerError::MessageNotFound("Resource not found".to_string())),
            ),
            ("m4".to_string(), Ok(good("m4"))),
        ];

        let kept = keep_fetched("primary", fetched).unwrap();
        let ids: Vec<_> = kept.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m4"]);
    }

    #[test]
    fn test_keep_fetched_fails_on_other_errors() {
        let fetched = vec![(
            "m1".to_string(),
            Err(PollerError::Forbidden("HTTP 403".to_string())),
        )];
        assert!(matches!(
            keep_fetched("primary", fetched),
            Err(PollerError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_with_retry_waits_retry_after_on_rate_limit() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = GmailSession::with_retry("test_op", 3, || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                if count.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(PollerError::RateLimitExceeded { retry_after: 0 })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_max_retries() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = GmailSession::with_retry("test_op", 2, || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PollerError::RateLimitExceeded { retry_after: 0 })
            }
        })
        .await;

        assert!(matches!(result, Err(PollerError::RateLimitExceeded { .. })));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_transient_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = GmailSession::with_retry("test_op", 3, || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                let current = count.fetch_add(1, Ordering::SeqCst);
                if current < 2 {
                    Err(PollerError::NetworkError("Connection timeout".to_string()))
                } else {
                    Ok("success".to_string())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_fails_on_permanent_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = Arc::clone(&attempt_count);

        let result = GmailSession::with_retry("test_op", 3, || {
            let count = Arc::clone(&attempt_count_clone);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(PollerError::AuthError("Invalid credentials".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }
}
