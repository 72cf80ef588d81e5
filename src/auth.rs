//! OAuth2 authentication for per-account Gmail sessions

use google_gmail1::{hyper_rustls, hyper_util, yup_oauth2, Gmail};

use crate::config::AccountCredentials;
use crate::error::{PollerError, Result};

/// Gmail API scopes the poller needs
///
/// - gmail.modify: read messages and change their labels
/// - gmail.labels: list and create labels
pub const REQUIRED_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.labels",
];

pub type HttpsConnector =
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>;

/// Type alias for Gmail Hub to simplify type signatures
pub type GmailHub = Gmail<HttpsConnector>;

/// Check that the credentials are complete enough to authenticate
///
/// A refresh token needs the client id and secret to be refreshed; a bare
/// access token is used as-is.
pub fn check_credentials(credentials: &AccountCredentials) -> Result<()> {
    if credentials.refresh_token.is_some() {
        if credentials.client_id.as_deref().unwrap_or("").is_empty() {
            return Err(PollerError::ConfigError(
                "credentials.client_id is required with a refresh_token".to_string(),
            ));
        }
        if credentials.client_secret.as_deref().unwrap_or("").is_empty() {
            return Err(PollerError::ConfigError(
                "credentials.client_secret is required with a refresh_token".to_string(),
            ));
        }
        return Ok(());
    }

    if credentials.access_token.as_deref().is_some_and(|t| !t.is_empty()) {
        return Ok(());
    }

    Err(PollerError::ConfigError(
        "credentials need a refresh_token or an access_token".to_string(),
    ))
}

/// Build the TLS connector used for Gmail API calls
///
/// Uses native roots and HTTP/1 (works better with google-gmail1 than HTTP/2).
pub fn build_connector() -> Result<HttpsConnector> {
    Ok(hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| PollerError::NetworkError(format!("Failed to load TLS roots: {}", e)))?
        .https_or_http()
        .enable_http1()
        .build())
}

/// Authenticate with the account's credentials and build a Gmail hub
///
/// The token is requested once up front so that bad credentials surface
/// here instead of on the first fetch.
pub async fn initialize_gmail_hub(
    connector: HttpsConnector,
    credentials: &AccountCredentials,
) -> Result<GmailHub> {
    check_credentials(credentials)?;

    let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
        .build(connector);

    if let Some(refresh_token) = &credentials.refresh_token {
        let secret = yup_oauth2::authorized_user::AuthorizedUserSecret {
            client_id: credentials.client_id.clone().unwrap_or_default(),
            client_secret: credentials.client_secret.clone().unwrap_or_default(),
            refresh_token: refresh_token.clone(),
            key_type: "authorized_user".to_string(),
        };

        let auth = yup_oauth2::AuthorizedUserAuthenticator::builder(secret)
            .build()
            .await
            .map_err(|e| PollerError::AuthError(format!("Failed to build authenticator: {}", e)))?;

        auth.token(REQUIRED_SCOPES)
            .await
            .map_err(|e| PollerError::AuthError(format!("Failed to obtain token: {}", e)))?;

        return Ok(Gmail::new(client, auth));
    }

    let access_token = credentials.access_token.clone().unwrap_or_default();
    let auth = yup_oauth2::AccessTokenAuthenticator::builder(access_token)
        .build()
        .await
        .map_err(|e| PollerError::AuthError(format!("Failed to build authenticator: {}", e)))?;

    Ok(Gmail::new(client, auth))
}
