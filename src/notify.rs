//! End-of-run notification summary.
//!
//! All formatting is pure string work; the actual delivery lives in
//! [`crate::telegram`]. Every piece of sheet-derived text is escaped for
//! MarkdownV2 before the formatting markers are added around it.

use std::collections::HashMap;

use crate::record::NOT_AVAILABLE;

/// Characters Telegram's MarkdownV2 parse mode requires escaping.
const MARKDOWN_ESCAPE_CHARS: &str = r"_*[]()~`>#+-=|{}.!";

/// Backslash-escape every MarkdownV2 special character.
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if MARKDOWN_ESCAPE_CHARS.contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// One merged-row update queued for the summary.
#[derive(Debug, Clone)]
pub struct UpdateNotice {
    /// Row state after the merge, for the title and company lines.
    pub after: HashMap<String, String>,
    /// Field names whose values changed, with their new values shown.
    pub changed: Vec<String>,
}

/// Accumulates what happened during one run for the closing notification.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub new_opportunities: Vec<HashMap<String, String>>,
    pub updates: Vec<UpdateNotice>,
}

impl RunSummary {
    pub fn is_empty(&self) -> bool {
        self.new_opportunities.is_empty() && self.updates.is_empty()
    }
}

fn field<'a>(map: &'a HashMap<String, String>, name: &str, default: &'a str) -> &'a str {
    map.get(name)
        .filter(|v| !v.is_empty())
        .map(String::as_str)
        .unwrap_or(default)
}

fn format_new_opportunity(data: &HashMap<String, String>) -> String {
    let title = escape_markdown(field(data, "Role Title", NOT_AVAILABLE));
    let company = escape_markdown(field(data, "Institution/Company", NOT_AVAILABLE));
    let eligibility = escape_markdown(field(data, "Eligibility", "All"));
    let deadline = escape_markdown(field(data, "Application Deadline", NOT_AVAILABLE));
    let location = escape_markdown(field(data, "Location", NOT_AVAILABLE));
    let mode = escape_markdown(field(data, "Work Mode", NOT_AVAILABLE));
    let commitment = escape_markdown(field(data, "Time Commitment", NOT_AVAILABLE));
    let stipend = escape_markdown(field(data, "Stipend Details", NOT_AVAILABLE));

    format!(
        "*Opportunity: {title}*\n\
         *Company:* {company}\n\n\
         🎓 *Eligibility:* {eligibility}\n\
         📅 *Deadline:* {deadline}\n\
         📍 *Location:* {location} \\({mode}\\)\n\
         💼 *Commitment:* {commitment}\n\
         💰 *Stipend:* {stipend}"
    )
}

fn format_update(notice: &UpdateNotice) -> Option<String> {
    if notice.changed.is_empty() {
        return None;
    }

    let title = escape_markdown(field(&notice.after, "Role Title", NOT_AVAILABLE));
    let company = escape_markdown(field(&notice.after, "Institution/Company", NOT_AVAILABLE));

    let changes: Vec<String> = notice
        .changed
        .iter()
        .map(|key| {
            let clean_key = escape_markdown(key);
            let clean_value = escape_markdown(field(&notice.after, key, NOT_AVAILABLE));
            format!("\\- *{clean_key}:* {clean_value}")
        })
        .collect();

    Some(format!(
        "*Opportunity: {title}*\n\
         *Company:* {company}\n\n\
         {}\n\
         {}",
        escape_markdown("The following details were updated:"),
        changes.join("\n")
    ))
}

/// Build the MarkdownV2 summary message, or `None` when nothing happened.
pub fn build_summary(summary: &RunSummary, sheet_link: &str) -> Option<String> {
    if summary.is_empty() {
        return None;
    }

    let mut message = format!("*{}*\n\n", escape_markdown("🔔 AI Agent Alert!"));

    if !summary.new_opportunities.is_empty() {
        message.push_str(&escape_markdown("Found these new opportunities for you:"));
        message.push('\n');
        for opp in &summary.new_opportunities {
            message.push_str(&format_new_opportunity(opp));
            message.push_str("\n\n");
        }
    }

    if !summary.updates.is_empty() {
        message.push_str(&escape_markdown("The following opportunities were updated:"));
        message.push('\n');
        for notice in &summary.updates {
            if let Some(update) = format_update(notice) {
                message.push_str(&update);
                message.push_str("\n\n");
            }
        }
    }

    if !sheet_link.is_empty() {
        message.push_str(&escape_markdown("Find out more details at:"));
        message.push('\n');
        message.push_str(&escape_markdown(sheet_link));
    }

    Some(message.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strmap(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_escape_markdown_specials() {
        assert_eq!(
            escape_markdown("2025-08-01 (tentative)"),
            r"2025\-08\-01 \(tentative\)"
        );
        assert_eq!(escape_markdown("a_b*c.d!e"), r"a\_b\*c\.d\!e");
        assert_eq!(escape_markdown("plain words"), "plain words");
    }

    #[test]
    fn test_escape_markdown_full_set() {
        for ch in MARKDOWN_ESCAPE_CHARS.chars() {
            let escaped = escape_markdown(&ch.to_string());
            assert_eq!(escaped, format!("\\{ch}"));
        }
    }

    #[test]
    fn test_build_summary_empty_is_none() {
        assert!(build_summary(&RunSummary::default(), "https://sheet").is_none());
    }

    #[test]
    fn test_build_summary_new_opportunity() {
        let summary = RunSummary {
            new_opportunities: vec![strmap(&[
                ("Role Title", "Research Intern"),
                ("Institution/Company", "IIT Madras"),
                ("Application Deadline", "2025-08-01"),
                ("Location", "Chennai"),
                ("Work Mode", "On-site"),
                ("Time Commitment", "Full-time"),
                ("Stipend Details", "INR 20,000/month"),
            ])],
            updates: Vec::new(),
        };

        let message = build_summary(&summary, "https://docs.google.com/sheet").unwrap();
        assert!(message.starts_with("*🔔 AI Agent Alert\\!*"));
        assert!(message.contains("*Opportunity: Research Intern*"));
        assert!(message.contains("🎓 *Eligibility:* All"));
        assert!(message.contains(r"📅 *Deadline:* 2025\-08\-01"));
        assert!(message.contains(r"📍 *Location:* Chennai \(On\-site\)"));
        assert!(message.contains(r"https://docs\.google\.com/sheet"));
        // Trailing whitespace trimmed for Telegram.
        assert_eq!(message, message.trim());
    }

    #[test]
    fn test_build_summary_update_lists_changed_fields_only() {
        let summary = RunSummary {
            new_opportunities: Vec::new(),
            updates: vec![UpdateNotice {
                after: strmap(&[
                    ("Role Title", "Research Intern"),
                    ("Institution/Company", "IIT Madras"),
                    ("Application Deadline", "2025-09-01"),
                    ("Location", "Chennai"),
                ]),
                changed: vec!["Application Deadline".to_string()],
            }],
        };

        let message = build_summary(&summary, "https://sheet").unwrap();
        assert!(message.contains("The following opportunities were updated:"));
        assert!(message.contains(r"\- *Application Deadline:* 2025\-09\-01"));
        assert!(!message.contains(r"\- *Location:*"));
    }

    #[test]
    fn test_build_summary_without_link_omits_footer() {
        let summary = RunSummary {
            new_opportunities: vec![strmap(&[("Role Title", "Research Intern")])],
            updates: Vec::new(),
        };

        let message = build_summary(&summary, "").unwrap();
        assert!(!message.contains("Find out more details at:"));
        assert_eq!(message, message.trim());
    }

    #[test]
    fn test_format_update_no_changes_is_none() {
        let notice = UpdateNotice {
            after: strmap(&[("Role Title", "X")]),
            changed: Vec::new(),
        };
        assert!(format_update(&notice).is_none());
    }
}
