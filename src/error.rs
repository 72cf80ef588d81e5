use thiserror::Error;

/// Type alias for Result with PollerError
pub type Result<T> = std::result::Result<T, PollerError>;

/// Error types for the mail poller and its provider sessions
#[derive(Error, Debug)]
pub enum PollerError {
    /// `Scheduler::start` was called more than once
    #[error("Scheduler already started")]
    AlreadyStarted,

    /// A polling loop is already running for this account
    #[error("Polling already active for account {account_id}")]
    AlreadyPolling { account_id: String },

    /// A polling loop ended with an error
    #[error("error polling account {account_id}: {source}")]
    AccountFailed {
        account_id: String,
        #[source]
        source: Box<PollerError>,
    },

    /// A polling task ended without reporting an outcome (panicked or aborted)
    #[error("Polling task aborted: {0}")]
    LoopAborted(String),

    /// Account id is not present in the configuration
    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    /// Session used before connect/authenticate, or after close
    #[error("Session not connected: {0}")]
    NotConnected(String),

    /// Mail provider API returned an error
    #[error("Mail API error: {0}")]
    ApiError(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Invalid message format or parsing error
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Label lookup or creation failed
    #[error("Label error: {0}")]
    LabelError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl PollerError {
    /// Check if the error is transient and the same request may be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PollerError::RateLimitExceeded { .. }
                | PollerError::ServerError { .. }
                | PollerError::NetworkError(_)
        )
    }

    /// Whether the session that produced this error can no longer be trusted.
    ///
    /// The poll operation drops and closes such a session so the next cycle
    /// connects and authenticates from scratch.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            PollerError::AuthError(_) | PollerError::NetworkError(_) | PollerError::NotConnected(_)
        )
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// The Retry-After header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns 5 seconds when the header is missing, invalid or in the past.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    let Some(value) = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
    else {
        return DEFAULT_RETRY_AFTER;
    };

    if let Ok(seconds) = value.parse::<u64>() {
        return seconds;
    }

    httpdate::parse_http_date(value)
        .ok()
        .and_then(|when| when.duration_since(std::time::SystemTime::now()).ok())
        .map(|remaining| remaining.as_secs())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

impl From<google_gmail1::Error> for PollerError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    429 => PollerError::RateLimitExceeded {
                        retry_after: parse_retry_after_header(response),
                    },
                    401 => PollerError::AuthError(message),
                    404 => PollerError::MessageNotFound("Resource not found".to_string()),
                    400 => PollerError::BadRequest(message),
                    403 => PollerError::Forbidden(message),
                    500..=599 => PollerError::ServerError {
                        status: status_code,
                        message,
                    },
                    _ => PollerError::ApiError(message),
                }
            }
            google_gmail1::Error::BadRequest(ref err) => PollerError::BadRequest(format!("{}", err)),
            google_gmail1::Error::MissingToken(ref err) => {
                PollerError::AuthError(format!("Token unavailable: {}", err))
            }
            google_gmail1::Error::HttpError(ref err) => {
                PollerError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => PollerError::NetworkError(err.to_string()),
            _ => PollerError::ApiError(error.to_string()),
        }
    }
}
