//! Telegram Bot API delivery for the run summary.

use serde_json::json;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sendMessage failed ({status}): {message}")]
    Api { status: u16, message: String },
}

/// Send a MarkdownV2 message to the configured chat. Best-effort: callers
/// log failures rather than retry, since the sheet write already happened.
pub async fn send(
    client: &reqwest::Client,
    bot_token: &str,
    chat_id: &str,
    text: &str,
) -> Result<(), TelegramError> {
    let url = format!("{}/bot{}/sendMessage", TELEGRAM_API_BASE, bot_token);
    let payload = json!({
        "chat_id": chat_id,
        "text": text,
        "parse_mode": "MarkdownV2",
    });

    let response = client.post(&url).json(&payload).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TelegramError::Api {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        });
    }

    log::info!("notification sent");
    Ok(())
}
