//! Runtime configuration.
//!
//! Everything the agent needs is resolved once at startup into a [`Config`]
//! and passed by reference into the components — no module-level state.
//! Missing required values are fatal before any provider is touched.

use std::path::PathBuf;

use thiserror::Error;

/// Opportunity keywords used when `OPPORTUNITY_KEYWORDS` is not set.
pub const DEFAULT_OPPORTUNITY_KEYWORDS: &[&str] = &[
    "internship",
    "hiring",
    "research fellowship",
    "research internship",
    "fellowship",
    "recruiting",
    "job alert",
    "job opportunity",
];

/// Gmail search window used when `MAIL_QUERY_WINDOW` is not set.
pub const DEFAULT_QUERY_WINDOW: &str = "newer_than:1h";

/// Processed-id retention window used when `RETENTION_DAYS` is not set.
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("{0} must not be empty")]
    EmptyList(&'static str),
    #[error("invalid {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("could not read resume file {path}: {source}")]
    ResumeUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// OAuth client material for the refresh-token grant.
#[derive(Debug, Clone)]
pub struct GoogleAuth {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub refresh_token: String,
}

/// Agent configuration, assembled from the environment in [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct Config {
    pub gemini_api_key: String,
    pub spreadsheet_id: String,
    /// Human-facing sheet URL for the notification footer.
    pub sheet_link: String,
    pub google: GoogleAuth,
    /// Telegram credentials; notification is skipped when either is unset.
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    /// Own address, excluded from the mailbox search (`-from:<self>`).
    pub self_email: Option<String>,
    pub query_window: String,
    pub retention_days: u32,
    /// Sender domains allowed past the first filter stage.
    pub trusted_domains: Vec<String>,
    /// Subject/body keywords required by the second filter stage.
    pub opportunity_keywords: Vec<String>,
    /// Resume/profile text interpolated into the initial extraction prompt.
    pub resume_text: String,
    pub processed_ids_path: PathBuf,
    pub token_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let trusted_domains = parse_list(&require("TRUSTED_DOMAINS")?);
        if trusted_domains.is_empty() {
            return Err(ConfigError::EmptyList("TRUSTED_DOMAINS"));
        }

        let opportunity_keywords = match optional("OPPORTUNITY_KEYWORDS") {
            Some(raw) => {
                let keywords = parse_list(&raw);
                if keywords.is_empty() {
                    return Err(ConfigError::EmptyList("OPPORTUNITY_KEYWORDS"));
                }
                keywords
            }
            None => DEFAULT_OPPORTUNITY_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        let retention_days = match optional("RETENTION_DAYS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "RETENTION_DAYS",
                    value: raw,
                })?,
            None => DEFAULT_RETENTION_DAYS,
        };

        let resume_path = PathBuf::from(
            optional("RESUME_PATH").unwrap_or_else(|| "resume.txt".to_string()),
        );
        let resume_text = std::fs::read_to_string(&resume_path).map_err(|source| {
            ConfigError::ResumeUnreadable {
                path: resume_path,
                source,
            }
        })?;

        Ok(Self {
            gemini_api_key: require("GEMINI_API_KEY")?,
            spreadsheet_id: require("SPREADSHEET_ID")?,
            sheet_link: optional("GOOGLE_SHEET_LINK").unwrap_or_default(),
            google: GoogleAuth {
                client_id: require("GOOGLE_CLIENT_ID")?,
                client_secret: optional("GOOGLE_CLIENT_SECRET"),
                refresh_token: require("GOOGLE_REFRESH_TOKEN")?,
            },
            telegram_bot_token: optional("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: optional("TELEGRAM_CHAT_ID"),
            self_email: optional("SELF_EMAIL_ADDRESS"),
            query_window: optional("MAIL_QUERY_WINDOW")
                .unwrap_or_else(|| DEFAULT_QUERY_WINDOW.to_string()),
            retention_days,
            trusted_domains,
            opportunity_keywords,
            resume_text,
            processed_ids_path: PathBuf::from(
                optional("PROCESSED_IDS_PATH").unwrap_or_else(|| "processed_emails.json".into()),
            ),
            token_path: PathBuf::from(
                optional("GOOGLE_TOKEN_PATH").unwrap_or_else(|| "token.json".into()),
            ),
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::MissingVar(name))
}

fn optional(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

/// Split a comma-separated env value into trimmed, lowercased entries.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_trims_and_lowercases() {
        let parsed = parse_list(" iitm.ac.in , Example.COM ,, ");
        assert_eq!(parsed, vec!["iitm.ac.in", "example.com"]);
    }

    #[test]
    fn test_parse_list_empty() {
        assert!(parse_list("").is_empty());
        assert!(parse_list(" , ,").is_empty());
    }

    #[test]
    fn test_default_keywords_lowercase() {
        for kw in DEFAULT_OPPORTUNITY_KEYWORDS {
            assert_eq!(*kw, kw.to_lowercase());
        }
    }
}
