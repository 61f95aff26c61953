//! Gmail REST client: message search, metadata fetch, attachment download.
//!
//! Message bodies are pulled from `text/plain` MIME parts only; HTML parts
//! are ignored. Attachment parts are surfaced as references and fetched
//! lazily, after the cheap filters have passed.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use super::{send_with_retry, GoogleApiError, RetryPolicy};
use crate::classify::extract_email_address;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentResponse {
    #[serde(default)]
    data: Option<String>,
}

// ============================================================================
// Domain types
// ============================================================================

/// Pointer to an attachment body, fetched separately via [`fetch_attachment`].
#[derive(Debug, Clone)]
pub struct AttachmentRef {
    pub id: String,
    pub filename: String,
}

/// Everything downstream stages need from one email.
#[derive(Debug, Clone)]
pub struct EmailMetadata {
    pub id: String,
    pub thread_id: String,
    /// Full From header, e.g. `Jane Doe <jane@example.com>`.
    pub sender_raw: String,
    /// Lowercased bare address parsed out of the From header.
    pub sender_email: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<AttachmentRef>,
}

/// Mailbox operations the reconciler drives, as a seam for scripted stubs.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// List message ids matching a search query, newest first.
    async fn search_messages(&self, query: &str) -> Result<Vec<String>, GoogleApiError>;
    /// Fetch one message in full, flattened to [`EmailMetadata`].
    async fn fetch_metadata(&self, message_id: &str) -> Result<EmailMetadata, GoogleApiError>;
    /// Download and decode one attachment's bytes.
    async fn fetch_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, GoogleApiError>;
}

// ============================================================================
// Client
// ============================================================================

pub struct GmailClient {
    client: reqwest::Client,
    access_token: String,
    retry: RetryPolicy,
}

impl GmailClient {
    pub fn new(client: reqwest::Client, access_token: String) -> Self {
        Self {
            client,
            access_token,
            retry: RetryPolicy::default(),
        }
    }
}

#[async_trait]
impl Mailbox for GmailClient {
    async fn search_messages(&self, query: &str) -> Result<Vec<String>, GoogleApiError> {
        let request = self
            .client
            .get(format!("{}/messages", GMAIL_API_BASE))
            .bearer_auth(&self.access_token)
            .query(&[("q", query)]);

        let response = send_with_retry(request, &self.retry).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GoogleApiError::ApiError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let list: MessageListResponse = response.json().await?;
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn fetch_metadata(&self, message_id: &str) -> Result<EmailMetadata, GoogleApiError> {
        let request = self
            .client
            .get(format!("{}/messages/{}", GMAIL_API_BASE, message_id))
            .bearer_auth(&self.access_token)
            .query(&[("format", "full")]);

        let response = send_with_retry(request, &self.retry).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GoogleApiError::ApiError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let message: Message = response.json().await?;
        Ok(flatten_message(message))
    }

    async fn fetch_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, GoogleApiError> {
        let request = self
            .client
            .get(format!(
                "{}/messages/{}/attachments/{}",
                GMAIL_API_BASE, message_id, attachment_id
            ))
            .bearer_auth(&self.access_token);

        let response = send_with_retry(request, &self.retry).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GoogleApiError::ApiError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let attachment: AttachmentResponse = response.json().await?;
        let data = attachment.data.unwrap_or_default();
        Ok(decode_body_data(&data).unwrap_or_default())
    }
}

// ============================================================================
// MIME flattening
// ============================================================================

fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Gmail body data is URL-safe base64, occasionally padded.
fn decode_body_data(data: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .ok()
}

/// Walk the MIME tree collecting plain-text bodies and attachment refs.
fn walk_parts(part: &MessagePart, body: &mut String, attachments: &mut Vec<AttachmentRef>) {
    if !part.filename.is_empty() {
        if let Some(attachment_id) = part.body.as_ref().and_then(|b| b.attachment_id.clone()) {
            attachments.push(AttachmentRef {
                id: attachment_id,
                filename: part.filename.clone(),
            });
        }
    } else if part.mime_type == "text/plain" {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            if let Some(decoded) = decode_body_data(data) {
                body.push_str(&String::from_utf8_lossy(&decoded));
            }
        }
    }

    for child in &part.parts {
        walk_parts(child, body, attachments);
    }
}

fn flatten_message(message: Message) -> EmailMetadata {
    let payload = message.payload.unwrap_or_default();
    let sender_raw = header_value(&payload.headers, "From")
        .unwrap_or_default()
        .to_string();
    let subject = header_value(&payload.headers, "Subject")
        .unwrap_or_default()
        .to_string();

    let mut body = String::new();
    let mut attachments = Vec::new();
    walk_parts(&payload, &mut body, &mut attachments);

    EmailMetadata {
        id: message.id,
        thread_id: message.thread_id,
        sender_email: extract_email_address(&sender_raw),
        sender_raw,
        subject,
        body: body.trim().to_string(),
        attachments,
    }
}
