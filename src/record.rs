//! Opportunity record schema and merge logic.
//!
//! The sheet is the durable store; one row per mail thread, keyed by the
//! thread id in column 1. Field names are an explicit enumerated vocabulary,
//! and the sheet's own header row (re-read every run) is the authoritative
//! mapping from field name to column — never positional assumptions.

use std::collections::HashMap;

use log::warn;

/// 1-based row holding the column headers.
pub const HEADER_ROW: usize = 3;

/// 1-based first data row (directly below the headers).
pub const FIRST_DATA_ROW: usize = 4;

/// Sentinel the extractor emits for fields the email does not mention.
pub const NOT_AVAILABLE: &str = "N/A";

pub const THREAD_ID_FIELD: &str = "Thread ID";
pub const RELEVANCE_FIELD: &str = "Relevance Score (1-10)";

/// The fifteen fields produced by initial extraction, in sheet order.
pub const EXTRACTION_FIELDS: &[&str] = &[
    "Application Deadline",
    "Institution/Company",
    "Eligibility",
    "Role Title",
    "Opportunity Type",
    "Role Field",
    "Location",
    "Work Mode",
    "Duration",
    "Time Commitment",
    "Stipend Details",
    "Required Skills",
    "Job Description (JD)",
    "Application Link",
    RELEVANCE_FIELD,
];

/// Fields a follow-up email may update. Relevance is scored once, at intake.
pub const DELTA_FIELDS: &[&str] = &[
    "Application Deadline",
    "Institution/Company",
    "Eligibility",
    "Role Title",
    "Opportunity Type",
    "Role Field",
    "Location",
    "Work Mode",
    "Duration",
    "Time Commitment",
    "Stipend Details",
    "Required Skills",
    "Job Description (JD)",
    "Application Link",
];

/// Format a brand-new sheet row: thread key, intake timestamp, sender and
/// subject provenance, and the extracted fields in column order.
pub fn new_row(
    thread_id: &str,
    sender_raw: &str,
    subject: &str,
    extracted: &HashMap<String, String>,
) -> Vec<String> {
    let get = |field: &str, default: &str| -> String {
        extracted
            .get(field)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| default.to_string())
    };

    vec![
        thread_id.to_string(),
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        get("Application Deadline", NOT_AVAILABLE),
        sender_raw.to_string(),
        get("Institution/Company", NOT_AVAILABLE),
        get("Eligibility", "All"),
        get("Role Title", NOT_AVAILABLE),
        get("Opportunity Type", NOT_AVAILABLE),
        get("Role Field", NOT_AVAILABLE),
        get("Location", NOT_AVAILABLE),
        get("Work Mode", NOT_AVAILABLE),
        get("Duration", NOT_AVAILABLE),
        get("Time Commitment", NOT_AVAILABLE),
        get("Stipend Details", NOT_AVAILABLE),
        get("Required Skills", NOT_AVAILABLE),
        get("Job Description (JD)", NOT_AVAILABLE),
        get("Application Link", NOT_AVAILABLE),
        get(RELEVANCE_FIELD, NOT_AVAILABLE),
        subject.to_string(),
    ]
}

/// Zip a header row with a value row into a field map, padding short rows.
pub fn row_to_map(headers: &[String], values: &[String]) -> HashMap<String, String> {
    headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            let value = values.get(i).cloned().unwrap_or_default();
            (header.clone(), value)
        })
        .collect()
}

/// Rebuild a value row from a field map, in header order.
pub fn map_to_row(headers: &[String], map: &HashMap<String, String>) -> Vec<String> {
    headers
        .iter()
        .map(|h| map.get(h).cloned().unwrap_or_default())
        .collect()
}

/// Result of merging a delta extraction into the current row.
#[derive(Debug)]
pub struct MergeOutcome {
    pub merged: HashMap<String, String>,
    /// Field names whose values changed, in header order.
    pub changed: Vec<String>,
}

impl MergeOutcome {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// Merge a delta into the current field map.
///
/// A delta value is applied only when it is non-empty, not the "N/A"
/// sentinel, names a known header, and actually differs from the stored
/// value. Everything else leaves the row untouched.
pub fn apply_delta(
    current: &HashMap<String, String>,
    delta: &HashMap<String, String>,
    headers: &[String],
) -> MergeOutcome {
    let mut merged = current.clone();
    let mut changed = Vec::new();

    for header in headers {
        let Some(new_value) = delta.get(header) else {
            continue;
        };
        if new_value.is_empty() || new_value == NOT_AVAILABLE {
            continue;
        }
        if current.get(header) == Some(new_value) {
            continue;
        }
        merged.insert(header.clone(), new_value.clone());
        changed.push(header.clone());
    }

    for key in delta.keys() {
        if !headers.contains(key) {
            warn!("delta field '{}' not present in sheet headers; skipped", key);
        }
    }

    MergeOutcome { merged, changed }
}

/// 1-based column indices for the changed fields, for cell highlighting.
pub fn changed_columns(headers: &[String], changed: &[String]) -> Vec<usize> {
    changed
        .iter()
        .filter_map(|field| headers.iter().position(|h| h == field).map(|i| i + 1))
        .collect()
}
