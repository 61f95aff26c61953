//! Opportunity gating — cheap filters first, the model last.
//!
//! Three stages, ordered by cost: trusted sender domain, opportunity keyword
//! match, then a strict YES/NO model check. Any rejection is terminal for the
//! message; the caller still marks it processed.

use log::debug;

use crate::gemini::{GenerativeModel, ModelError};

/// Why a message was rejected before extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UntrustedSender,
    NoKeywordMatch,
    NotAnOpportunity,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UntrustedSender => write!(f, "sender domain not trusted"),
            Self::NoKeywordMatch => write!(f, "no opportunity keywords"),
            Self::NotAnOpportunity => write!(f, "model classified as not an opportunity"),
        }
    }
}

/// Extract the bare address from a "From" header like `Name <a@b.com>`.
pub fn extract_email_address(from_field: &str) -> String {
    if let Some(start) = from_field.find('<') {
        if let Some(end) = from_field.find('>') {
            if end > start {
                return from_field[start + 1..end].to_lowercase();
            }
        }
    }
    from_field.trim().to_lowercase()
}

/// Stage 1: the normalized sender must contain a trusted domain substring.
pub fn sender_is_trusted(sender_email: &str, trusted_domains: &[String]) -> bool {
    trusted_domains
        .iter()
        .any(|domain| sender_email.contains(domain.as_str()))
}

/// Lowercased subject+body haystack for the keyword stage and the model check.
pub fn search_text(subject: &str, body: &str) -> String {
    format!("{} {}", subject, body).to_lowercase()
}

/// Stage 2: the haystack must contain at least one opportunity keyword.
pub fn matches_keywords(search_text: &str, keywords: &[String]) -> bool {
    keywords.iter().any(|kw| search_text.contains(kw.as_str()))
}

/// Stage 3: ask the model for a strict YES/NO opportunity verdict.
///
/// Accepts on a case-insensitive "yes" substring — deliberately lenient about
/// the exact formatting of the reply.
pub async fn is_opportunity(
    model: &dyn GenerativeModel,
    email_text: &str,
) -> Result<bool, ModelError> {
    let prompt = format!(
        "Analyze the following email text. Is this a career opportunity \
         (internship, job, research, fellowship)? Strictly avoid events, shows \
         and talks. Respond with only the word YES or NO.\n\n\
         EMAIL TEXT:\n---\n{}\n---",
        email_text
    );
    let response = model.generate(&prompt).await?;
    let verdict = response.to_lowercase().contains("yes");
    debug!("opportunity check verdict: {}", verdict);
    Ok(verdict)
}
