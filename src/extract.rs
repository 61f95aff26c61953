//! Structured field extraction via the language model.
//!
//! Two prompt protocols: a full initial extraction for the first email of a
//! thread (body + attachment text + resume), and a delta extraction for
//! follow-ups that must return only the fields newly stated. Both expect a
//! bare JSON object; the parser takes the first `{` to the last `}` and
//! treats anything unparsable as "no result", never as a run error.

use std::collections::HashMap;

use log::{debug, warn};
use serde_json::Value;

use crate::gemini::{GenerativeModel, ModelError};
use crate::record::{DELTA_FIELDS, RELEVANCE_FIELD};

/// Attachment text is cut to this many bytes before prompt interpolation.
pub const ATTACHMENT_TEXT_CAP: usize = 4000;

/// Resume text cap for the initial extraction prompt.
pub const RESUME_TEXT_CAP: usize = 8000;

/// Email body cap for both prompts.
pub const BODY_TEXT_CAP: usize = 8000;

/// Relevance score stored when the model's score cannot be coerced.
pub const FALLBACK_RELEVANCE: &str = "3";

/// The text of one email as fed to the prompts.
#[derive(Debug, Clone, Copy)]
pub struct MessageText<'a> {
    pub subject: &'a str,
    pub sender_raw: &'a str,
    pub body: &'a str,
    pub attachment_text: &'a str,
}

// ============================================================================
// Prompt construction
// ============================================================================

fn build_initial_prompt(msg: &MessageText<'_>, resume_text: &str) -> String {
    format!(
        "Analyze the email and any attached document text.\n\
         Extract the fields in a valid JSON format.\n\
         For fields that contain a list of items (like 'Required Skills' or points in a \
         'Job Description') format the string with bullet points (\u{2022}) for readability.\n\
         If a field is not mentioned, use \"N/A\". Do not add any text outside the JSON object.\n\n\
         The required fields are: \"Application Deadline\", \"Institution/Company\", \
         \"Eligibility\", \"Role Title\", \"Opportunity Type\", \"Role Field\", \"Location\", \
         \"Work Mode\", \"Duration\", \"Time Commitment\", \"Stipend Details\", \
         \"Required Skills\", \"Job Description (JD)\", \"Application Link\", \
         \"Relevance Score (1-10)\".\n\n\
         FIELD DEFINITIONS AND FORMATTING RULES:\n\
         - \"Application Deadline\": the exact date; include a time like \"EOD\" or \"11:59 PM\" if stated.\n\
         - \"Institution/Company\": the name of the organization.\n\
         - \"Eligibility\": summarize who can apply; if not mentioned, default to \"All\".\n\
         - \"Role Title\": the official title of the position.\n\
         - \"Opportunity Type\": ONE of: Internship, Research Internship, Full-time, Part-time, \
           Fellowship, Contest, Institute Student Body positions.\n\
         - \"Role Field\": the specific domain, e.g. Software Engineering, Data Science, Finance.\n\
         - \"Location\": city and country, e.g. \"Bengaluru, India\".\n\
         - \"Work Mode\": ONE of: On-site, Remote, Hybrid.\n\
         - \"Duration\": length of the opportunity, e.g. \"6 Months\".\n\
         - \"Time Commitment\": expected hours, e.g. \"Part-time (20 hrs/week)\".\n\
         - \"Stipend Details\": exact numbers or range, including currency.\n\
         - \"Required Skills\": bulleted (\u{2022}) list of key skills or qualifications.\n\
         - \"Job Description (JD)\": concise bulleted (\u{2022}) summary of responsibilities.\n\
         - \"Application Link\": the direct URL; if applications go by reply, write \"Reply to email\".\n\n\
         CRITICAL INSTRUCTION FOR RELEVANCE SCORING:\n\
         - Be VERY strict when calculating the \"Relevance Score (1-10)\"; it reflects how well \
           the opportunity matches the candidate's profile.\n\
         - Compare the candidate's resume against the opportunity: field of study, skills, \
           experience level, overall fit.\n\
         - 10 = perfect match; 7-9 = strong match; 4-6 = moderate match; 1-3 = weak match.\n\
         - BE CONSERVATIVE - default to lower scores when in doubt.\n\n\
         CANDIDATE'S RESUME:\n---\n{resume}\n---\n\n\
         EMAIL CONTENT:\n---\nSubject: {subject}\nFrom: {sender}\nBody: {body}\n---\n\n\
         ATTACHED DOCUMENT TEXT:\n---\n{attachment}\n---\n\n\
         Provide ONLY the JSON output with no additional text.",
        resume = truncate_utf8(resume_text, RESUME_TEXT_CAP),
        subject = msg.subject,
        sender = msg.sender_raw,
        body = truncate_utf8(msg.body, BODY_TEXT_CAP),
        attachment = truncate_utf8(msg.attachment_text, ATTACHMENT_TEXT_CAP),
    )
}

fn build_delta_prompt(msg: &MessageText<'_>) -> String {
    let field_list = DELTA_FIELDS
        .iter()
        .map(|f| format!("\"{}\"", f))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "You are a data extraction assistant.\n\
         An opportunity has already been recorded. A new email has arrived in the same thread.\n\
         Analyze ONLY the new email content and its attachment below.\n\n\
         Extract ONLY the fields that are explicitly mentioned in this new email.\n\
         - If the new email mentions a new deadline, return a JSON object with just the \
           \"Application Deadline\" key.\n\
         - If the new email contains no new information about any of the possible fields, \
           return an empty JSON object {{}}.\n\
         - Do not include fields that are not mentioned in the new email.\n\n\
         POSSIBLE FIELDS: {fields}.\n\n\
         NEW EMAIL CONTENT:\n---\nSubject: {subject}\nBody: {body}\n---\n\n\
         NEW ATTACHMENT TEXT:\n---\n{attachment}\n---\n\n\
         JSON Output (only new information):",
        fields = field_list,
        subject = msg.subject,
        body = truncate_utf8(msg.body, BODY_TEXT_CAP),
        attachment = truncate_utf8(msg.attachment_text, ATTACHMENT_TEXT_CAP),
    )
}

// ============================================================================
// Response parsing
// ============================================================================

/// Pull the JSON object out of a model reply.
///
/// Takes the substring from the first `{` to the last `}` and parses it.
/// Missing braces or a parse failure yield `None`; the raw reply is logged
/// so the prompt can be debugged.
pub fn parse_model_json(raw: &str) -> Option<serde_json::Map<String, Value>> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }

    match serde_json::from_str::<Value>(&raw[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        Ok(other) => {
            warn!("model returned JSON but not an object: {}", other);
            None
        }
        Err(e) => {
            warn!("model JSON unparsable ({}); raw reply:\n{}", e, raw);
            None
        }
    }
}

/// Normalize a relevance score value to an integer string in [1, 10].
///
/// Accepts `"8"`, `"8/10"`, or a bare number; anything uncoercible becomes
/// the conservative [`FALLBACK_RELEVANCE`].
pub fn normalize_relevance_score(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return FALLBACK_RELEVANCE.to_string(),
    };

    let head = raw.split('/').next().unwrap_or("").trim();
    match head.parse::<f64>() {
        Ok(score) if score.is_finite() => {
            let clamped = score.round().clamp(1.0, 10.0);
            format!("{}", clamped as i64)
        }
        _ => {
            warn!("invalid relevance score {:?}, defaulting to {}", raw, FALLBACK_RELEVANCE);
            FALLBACK_RELEVANCE.to_string()
        }
    }
}

/// Coerce a JSON scalar to the opaque string the sheet stores.
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ============================================================================
// Extraction operations
// ============================================================================

/// Initial extraction: all fifteen canonical fields for a new opportunity.
///
/// `Ok(None)` means the model replied but produced nothing parsable — the
/// message is still terminal for this run, no row is written.
pub async fn extract_initial(
    model: &dyn GenerativeModel,
    msg: &MessageText<'_>,
    resume_text: &str,
) -> Result<Option<HashMap<String, String>>, ModelError> {
    let prompt = build_initial_prompt(msg, resume_text);
    let raw = model.generate(&prompt).await?;

    let Some(object) = parse_model_json(&raw) else {
        return Ok(None);
    };

    let mut fields = HashMap::new();
    for (key, value) in &object {
        if key == RELEVANCE_FIELD {
            continue;
        }
        match value_to_string(value) {
            Some(s) => {
                fields.insert(key.clone(), s);
            }
            None => warn!("dropping non-scalar extraction field '{}'", key),
        }
    }
    if let Some(score) = object.get(RELEVANCE_FIELD) {
        fields.insert(RELEVANCE_FIELD.to_string(), normalize_relevance_score(score));
    }

    Ok(Some(fields))
}

/// Delta extraction: only the fields newly stated by a follow-up email.
///
/// An empty map is a valid "no new information" result.
pub async fn extract_delta(
    model: &dyn GenerativeModel,
    msg: &MessageText<'_>,
) -> Result<Option<HashMap<String, String>>, ModelError> {
    let prompt = build_delta_prompt(msg);
    let raw = model.generate(&prompt).await?;

    let Some(object) = parse_model_json(&raw) else {
        return Ok(None);
    };

    let mut fields = HashMap::new();
    for (key, value) in &object {
        // Relevance is scored at intake only; ignore it if the model echoes it.
        if key == RELEVANCE_FIELD {
            debug!("delta extraction echoed relevance score; ignored");
            continue;
        }
        match value_to_string(value) {
            Some(s) => {
                fields.insert(key.clone(), s);
            }
            None => warn!("dropping non-scalar delta field '{}'", key),
        }
    }

    Ok(Some(fields))
}

// ============================================================================
// Helpers
// ============================================================================

/// Truncate at a UTF-8 boundary at or below `max_bytes`.
fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
