//! Shared Google API plumbing: error type, retry policy, OAuth tokens.
//!
//! Both Google services (Gmail, Sheets) go through [`send_with_retry`] and
//! authenticate with a refresh-token grant. The access token is cached in a
//! JSON file compatible with google-auth's `token.json` layout and renewed
//! when it is within a minute of expiry.

pub mod gmail;
pub mod sheets;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum GoogleApiError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token expired or revoked")]
    AuthExpired,
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Retry
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

fn status_is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn retry_delay(
    attempt: u32,
    policy: &RetryPolicy,
    retry_after: Option<&reqwest::header::HeaderValue>,
) -> Duration {
    if let Some(secs) = retry_after
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        return Duration::from_secs(secs.min(30));
    }

    let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
    let backoff = policy
        .initial_backoff_ms
        .saturating_mul(exponent)
        .min(policy.max_backoff_ms);
    Duration::from_millis(backoff)
}

/// Send a request, retrying rate limits, server errors, and transport
/// timeouts with exponential backoff (Retry-After honored when present).
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, GoogleApiError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let Some(cloned) = request.try_clone() else {
            return request.send().await.map_err(GoogleApiError::Http);
        };

        match cloned.send().await {
            Ok(response) => {
                let status = response.status();
                if status_is_retryable(status) && attempt < attempts {
                    let delay = retry_delay(
                        attempt,
                        policy,
                        response.headers().get(reqwest::header::RETRY_AFTER),
                    );
                    log::warn!(
                        "google api retry {}/{} after status {} (sleep {:?})",
                        attempt,
                        attempts,
                        status,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) => {
                if (err.is_timeout() || err.is_connect()) && attempt < attempts {
                    let delay = retry_delay(attempt, policy, None);
                    log::warn!(
                        "google api retry {}/{} after transport error: {} (sleep {:?})",
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(GoogleApiError::Http(err));
            }
        }
    }

    Err(GoogleApiError::RefreshFailed(
        "request exhausted retries".to_string(),
    ))
}

// ============================================================================
// Token types and I/O
// ============================================================================

/// OAuth2 token payload persisted to the token file.
///
/// Field names follow google-auth's `Credentials.to_json()` so an existing
/// `token.json` from another tool is accepted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleToken {
    /// The short-lived access token.
    #[serde(alias = "access_token")]
    pub token: String,
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Expiry time (ISO 8601).
    #[serde(default)]
    pub expiry: Option<String>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn load_token(path: &Path) -> Option<GoogleToken> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(token) => Some(token),
        Err(e) => {
            log::warn!("token file {} unparsable ({}); re-seeding from config", path.display(), e);
            None
        }
    }
}

fn save_token(path: &Path, token: &GoogleToken) -> Result<(), GoogleApiError> {
    let json = serde_json::to_string_pretty(token)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Build a token shell from configured credentials, forcing a first refresh.
fn seed_token(config: &Config) -> GoogleToken {
    GoogleToken {
        token: String::new(),
        refresh_token: Some(config.google.refresh_token.clone()),
        token_uri: default_token_uri(),
        client_id: config.google.client_id.clone(),
        client_secret: config.google.client_secret.clone(),
        expiry: None,
    }
}

/// Whether the access token is missing, unparsable, or within 60s of expiry.
pub fn is_token_expired(token: &GoogleToken) -> bool {
    if token.token.is_empty() {
        return true;
    }
    match &token.expiry {
        None => true,
        Some(expiry_str) => {
            match chrono::DateTime::parse_from_rfc3339(&expiry_str.replace('Z', "+00:00"))
                .or_else(|_| chrono::DateTime::parse_from_rfc3339(expiry_str))
            {
                Ok(expiry) => expiry <= chrono::Utc::now() + chrono::Duration::seconds(60),
                Err(_) => true,
            }
        }
    }
}

// ============================================================================
// Token refresh
// ============================================================================

async fn refresh_access_token(
    token: &GoogleToken,
    token_path: &Path,
) -> Result<GoogleToken, GoogleApiError> {
    let refresh_token = token
        .refresh_token
        .as_deref()
        .ok_or(GoogleApiError::AuthExpired)?;

    let mut form = vec![
        ("client_id", token.client_id.as_str()),
        ("refresh_token", refresh_token),
        ("grant_type", "refresh_token"),
    ];
    if let Some(secret) = token.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let client = reqwest::Client::new();
    let resp = client.post(&token.token_uri).form(&form).send().await?;
    let status = resp.status();
    let body_text = resp.text().await.unwrap_or_default();

    if !status.is_success() {
        let lowered = body_text.to_lowercase();
        if (status.as_u16() == 400 || status.as_u16() == 401)
            && lowered.contains("invalid_grant")
        {
            return Err(GoogleApiError::AuthExpired);
        }
        return Err(GoogleApiError::RefreshFailed(format!(
            "HTTP {}: {}",
            status, body_text
        )));
    }

    let body: serde_json::Value = serde_json::from_str(&body_text)?;
    let access_token = body["access_token"]
        .as_str()
        .ok_or_else(|| GoogleApiError::RefreshFailed("no access_token in response".into()))?;
    let expires_in = body["expires_in"].as_u64().unwrap_or(3600);
    let expiry = chrono::Utc::now() + chrono::Duration::seconds(expires_in as i64);

    let mut renewed = token.clone();
    renewed.token = access_token.to_string();
    renewed.expiry = Some(expiry.to_rfc3339());

    save_token(token_path, &renewed)?;
    log::info!("refreshed Google access token");
    Ok(renewed)
}

/// Get a valid access token, refreshing (and persisting) if needed.
///
/// Entry point for every Google call in a run. Seeds the token file from the
/// configured refresh token on first use.
pub async fn get_valid_access_token(config: &Config) -> Result<String, GoogleApiError> {
    let token = load_token(&config.token_path).unwrap_or_else(|| seed_token(config));

    if is_token_expired(&token) {
        let renewed = refresh_access_token(&token, &config.token_path).await?;
        Ok(renewed.token)
    } else {
        Ok(token.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(access: &str, expiry: Option<String>) -> GoogleToken {
        GoogleToken {
            token: access.to_string(),
            refresh_token: Some("1//refresh".to_string()),
            token_uri: default_token_uri(),
            client_id: "client.apps.googleusercontent.com".to_string(),
            client_secret: Some("secret".to_string()),
            expiry,
        }
    }

    #[test]
    fn test_token_roundtrip() {
        let t = token("ya29.access", Some("2026-02-08T12:00:00Z".to_string()));
        let json = serde_json::to_string_pretty(&t).unwrap();
        let parsed: GoogleToken = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.token, "ya29.access");
        assert_eq!(parsed.refresh_token.as_deref(), Some("1//refresh"));
    }

    #[test]
    fn test_token_access_token_alias() {
        let json = r#"{
            "access_token": "ya29.alias",
            "refresh_token": "1//r",
            "client_id": "c"
        }"#;
        let parsed: GoogleToken = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.token, "ya29.alias");
        assert_eq!(parsed.token_uri, default_token_uri());
    }

    #[test]
    fn test_is_token_expired_no_expiry() {
        assert!(is_token_expired(&token("t", None)));
    }

    #[test]
    fn test_is_token_expired_empty_access() {
        let future = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        assert!(is_token_expired(&token("", Some(future))));
    }

    #[test]
    fn test_is_token_expired_future() {
        let future = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        assert!(!is_token_expired(&token("t", Some(future))));
    }

    #[test]
    fn test_is_token_expired_past() {
        let past = (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        assert!(is_token_expired(&token("t", Some(past))));
    }

    #[test]
    fn test_is_token_expired_python_style_expiry() {
        let future = chrono::Utc::now() + chrono::Duration::hours(1);
        let microsecond_z = future.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string();
        assert!(!is_token_expired(&token("t", Some(microsecond_z))));
    }

    #[test]
    fn test_retry_delay_honors_retry_after() {
        let policy = RetryPolicy::default();
        let header = reqwest::header::HeaderValue::from_static("5");
        assert_eq!(
            retry_delay(1, &policy, Some(&header)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_retry_delay_backs_off() {
        let policy = RetryPolicy::default();
        let first = retry_delay(1, &policy, None);
        let second = retry_delay(2, &policy, None);
        let huge = retry_delay(10, &policy, None);
        assert!(second > first);
        assert_eq!(huge, Duration::from_millis(policy.max_backoff_ms));
    }
}
