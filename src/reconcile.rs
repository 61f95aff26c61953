//! One polling cycle: search the mailbox, filter, extract, reconcile the
//! sheet, then notify.
//!
//! Failures are scoped per message. Anything that goes wrong while handling
//! one email is logged and the message is still marked processed, so a
//! poison message cannot wedge the agent. Only provider-level failures
//! (token refresh, opening the sheet, the mailbox search itself) abort the
//! run. The mailbox, sheet, and model all sit behind traits so the decision
//! sequence can be driven by scripted stubs in tests.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};

use crate::attachments;
use crate::classify::{self, Rejection};
use crate::config::Config;
use crate::extract::{self, MessageText};
use crate::gemini::{GenerativeModel, ModelError};
use crate::google_api::gmail::{EmailMetadata, GmailClient, Mailbox};
use crate::google_api::sheets::{locate_thread_row, OpportunitySheet, SheetsClient};
use crate::google_api::{self, GoogleApiError};
use crate::notify::{build_summary, RunSummary, UpdateNotice};
use crate::record;
use crate::retention::ProcessedStore;
use crate::telegram;

/// Fixed pause between messages, to stay inside provider rate limits.
const MESSAGE_PAUSE: Duration = Duration::from_secs(5);

/// Run-fatal failures. Per-message errors never surface here.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("google API: {0}")]
    Google(#[from] GoogleApiError),
}

#[derive(Debug, thiserror::Error)]
enum MessageError {
    #[error("google API: {0}")]
    Google(#[from] GoogleApiError),
    #[error("model: {0}")]
    Model(#[from] ModelError),
}

#[derive(Debug, PartialEq)]
enum MessageOutcome {
    Filtered(Rejection),
    Added,
    Updated,
    Unchanged,
    ExtractionFailed,
    RowMissing,
}

impl fmt::Display for MessageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filtered(rejection) => write!(f, "filtered ({})", rejection),
            Self::Added => write!(f, "new opportunity recorded"),
            Self::Updated => write!(f, "existing opportunity updated"),
            Self::Unchanged => write!(f, "no new information"),
            Self::ExtractionFailed => write!(f, "extraction produced nothing usable"),
            Self::RowMissing => write!(f, "tracked thread has no sheet row"),
        }
    }
}

/// Build the mailbox search query from the configured window and self filter.
fn compose_query(window: &str, self_email: Option<&str>) -> String {
    match self_email {
        Some(own) => format!("{} -from:{}", window, own),
        None => window.to_string(),
    }
}

/// Execute one full polling cycle.
pub async fn run(config: &Config, model: &dyn GenerativeModel) -> Result<(), RunError> {
    let access_token = google_api::get_valid_access_token(config).await?;
    let http = reqwest::Client::new();
    let gmail = GmailClient::new(http.clone(), access_token.clone());
    let sheets = SheetsClient::open(http.clone(), access_token, &config.spreadsheet_id).await?;
    let mut store = ProcessedStore::load(&config.processed_ids_path, config.retention_days);

    let summary = run_cycle(config, model, &gmail, &sheets, &mut store).await?;

    match build_summary(&summary, &config.sheet_link) {
        Some(text) => match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat_id)) => {
                if let Err(e) = telegram::send(&http, token, chat_id, &text).await {
                    warn!("notification failed: {}", e);
                }
            }
            _ => info!("telegram not configured; skipping notification"),
        },
        None => info!("no new or updated opportunities this run"),
    }

    Ok(())
}

/// Search and drain the mailbox, reconciling each candidate into the sheet.
async fn run_cycle(
    config: &Config,
    model: &dyn GenerativeModel,
    mailbox: &dyn Mailbox,
    sheets: &dyn OpportunitySheet,
    store: &mut ProcessedStore,
) -> Result<RunSummary, RunError> {
    let mut known_threads = sheets.thread_id_column().await?;
    info!(
        "loaded {} processed id(s), {} tracked thread(s)",
        store.len(),
        known_threads.len()
    );

    let query = compose_query(&config.query_window, config.self_email.as_deref());
    let message_ids = mailbox.search_messages(&query).await?;
    if message_ids.is_empty() {
        info!("no messages matched '{}'", query);
        return Ok(RunSummary::default());
    }
    info!("{} message(s) to check", message_ids.len());

    let mut summary = RunSummary::default();

    for message_id in &message_ids {
        if store.contains(message_id) {
            debug!("message {} already processed", message_id);
            continue;
        }

        let result = process_message(
            config,
            model,
            mailbox,
            sheets,
            &mut known_threads,
            &mut summary,
            message_id,
        )
        .await;

        match result {
            Ok(outcome) => info!("message {}: {}", message_id, outcome),
            Err(e) => warn!("message {}: {}", message_id, e),
        }

        // Terminal either way; the id is never revisited within retention.
        if let Err(e) = store.record(message_id) {
            warn!("could not persist processed id {}: {}", message_id, e);
        }

        tokio::time::sleep(MESSAGE_PAUSE).await;
    }

    Ok(summary)
}

async fn process_message(
    config: &Config,
    model: &dyn GenerativeModel,
    mailbox: &dyn Mailbox,
    sheets: &dyn OpportunitySheet,
    known_threads: &mut Vec<String>,
    summary: &mut RunSummary,
    message_id: &str,
) -> Result<MessageOutcome, MessageError> {
    let email = mailbox.fetch_metadata(message_id).await?;

    // Cheap filters first: sender domain, then keywords, then the model.
    if !classify::sender_is_trusted(&email.sender_email, &config.trusted_domains) {
        return Ok(MessageOutcome::Filtered(Rejection::UntrustedSender));
    }
    let search_text = classify::search_text(&email.subject, &email.body);
    if !classify::matches_keywords(&search_text, &config.opportunity_keywords) {
        return Ok(MessageOutcome::Filtered(Rejection::NoKeywordMatch));
    }
    if !classify::is_opportunity(model, &search_text).await? {
        return Ok(MessageOutcome::Filtered(Rejection::NotAnOpportunity));
    }
    info!("email passed filters: '{}'", email.subject);

    // Attachments are fetched only after all filters pass.
    let attachment_text = collect_attachment_text(mailbox, &email).await;
    let msg = MessageText {
        subject: &email.subject,
        sender_raw: &email.sender_raw,
        body: &email.body,
        attachment_text: &attachment_text,
    };

    match locate_thread_row(known_threads, &email.thread_id) {
        Some(row) => merge_into_row(model, sheets, summary, &msg, row).await,
        None => {
            add_new_row(config, model, sheets, summary, &msg, &email.thread_id, known_threads)
                .await
        }
    }
}

async fn add_new_row(
    config: &Config,
    model: &dyn GenerativeModel,
    sheets: &dyn OpportunitySheet,
    summary: &mut RunSummary,
    msg: &MessageText<'_>,
    thread_id: &str,
    known_threads: &mut Vec<String>,
) -> Result<MessageOutcome, MessageError> {
    let Some(extracted) = extract::extract_initial(model, msg, &config.resume_text).await? else {
        return Ok(MessageOutcome::ExtractionFailed);
    };

    let row = record::new_row(thread_id, msg.sender_raw, msg.subject, &extracted);
    sheets.append_row(&row).await?;

    // Track locally so a later email in the same thread merges this run.
    known_threads.push(thread_id.to_string());
    summary.new_opportunities.push(extracted);

    Ok(MessageOutcome::Added)
}

async fn merge_into_row(
    model: &dyn GenerativeModel,
    sheets: &dyn OpportunitySheet,
    summary: &mut RunSummary,
    msg: &MessageText<'_>,
    row: usize,
) -> Result<MessageOutcome, MessageError> {
    // The sheet's header row is authoritative, re-read on every merge.
    let headers = sheets.header_row().await?;
    if headers.is_empty() {
        warn!("header row is empty; cannot merge");
        return Ok(MessageOutcome::RowMissing);
    }
    let current_values = sheets.row_values(row).await?;
    let current = record::row_to_map(&headers, &current_values);

    let Some(delta) = extract::extract_delta(model, msg).await? else {
        return Ok(MessageOutcome::ExtractionFailed);
    };

    let outcome = record::apply_delta(&current, &delta, &headers);
    if !outcome.has_changes() {
        return Ok(MessageOutcome::Unchanged);
    }

    for field in &outcome.changed {
        debug!(
            "updating '{}' from '{}' to '{}'",
            field,
            current.get(field).map(String::as_str).unwrap_or(""),
            outcome.merged[field]
        );
    }

    let final_row = record::map_to_row(&headers, &outcome.merged);
    sheets.update_row(row, &final_row).await?;

    let columns = record::changed_columns(&headers, &outcome.changed);
    if let Err(e) = sheets.highlight_cells(row, &columns).await {
        // The data is already saved; losing the highlight is cosmetic.
        warn!("could not highlight updated cells: {}", e);
    }

    summary.updates.push(UpdateNotice {
        after: outcome.merged,
        changed: outcome.changed,
    });

    Ok(MessageOutcome::Updated)
}

/// Fetch and decode every supported attachment, concatenating their text.
/// Per-attachment failures are logged and skipped.
async fn collect_attachment_text(mailbox: &dyn Mailbox, email: &EmailMetadata) -> String {
    let mut text = String::new();

    for attachment in &email.attachments {
        if !attachments::is_supported(&attachment.filename) {
            debug!("skipping unsupported attachment '{}'", attachment.filename);
            continue;
        }

        let bytes = match mailbox.fetch_attachment(&email.id, &attachment.id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("could not fetch attachment '{}': {}", attachment.filename, e);
                continue;
            }
        };

        match attachments::extract_text(&attachment.filename, bytes) {
            Ok(extracted) => {
                text.push_str(&extracted);
                text.push('\n');
            }
            Err(e) => warn!("could not read attachment '{}': {}", attachment.filename, e),
        }
    }

    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::config::GoogleAuth;
    use crate::gemini::test_support::ScriptedModel;
    use crate::record::FIRST_DATA_ROW;

    fn test_config() -> Config {
        Config {
            gemini_api_key: "key".to_string(),
            spreadsheet_id: "sheet-id".to_string(),
            sheet_link: "https://sheet".to_string(),
            google: GoogleAuth {
                client_id: "client".to_string(),
                client_secret: None,
                refresh_token: "refresh".to_string(),
            },
            telegram_bot_token: None,
            telegram_chat_id: None,
            self_email: None,
            query_window: "newer_than:1h".to_string(),
            retention_days: 7,
            trusted_domains: vec!["iitm.ac.in".to_string()],
            opportunity_keywords: vec!["internship".to_string()],
            resume_text: "CS student, ML projects".to_string(),
            processed_ids_path: "unused.json".into(),
            token_path: "unused-token.json".into(),
        }
    }

    fn email(id: &str, thread: &str, from: &str, subject: &str, body: &str) -> EmailMetadata {
        EmailMetadata {
            id: id.to_string(),
            thread_id: thread.to_string(),
            sender_raw: from.to_string(),
            sender_email: classify::extract_email_address(from),
            subject: subject.to_string(),
            body: body.to_string(),
            attachments: Vec::new(),
        }
    }

    struct StubMailbox {
        emails: Vec<EmailMetadata>,
        metadata_calls: Mutex<Vec<String>>,
    }

    impl StubMailbox {
        fn with_emails(emails: Vec<EmailMetadata>) -> Self {
            Self {
                emails,
                metadata_calls: Mutex::new(Vec::new()),
            }
        }

        fn metadata_calls(&self) -> Vec<String> {
            self.metadata_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Mailbox for StubMailbox {
        async fn search_messages(&self, _query: &str) -> Result<Vec<String>, GoogleApiError> {
            Ok(self.emails.iter().map(|e| e.id.clone()).collect())
        }

        async fn fetch_metadata(&self, message_id: &str) -> Result<EmailMetadata, GoogleApiError> {
            self.metadata_calls.lock().unwrap().push(message_id.to_string());
            self.emails
                .iter()
                .find(|e| e.id == message_id)
                .cloned()
                .ok_or(GoogleApiError::ApiError {
                    status: 404,
                    message: "no such message".to_string(),
                })
        }

        async fn fetch_attachment(
            &self,
            _message_id: &str,
            _attachment_id: &str,
        ) -> Result<Vec<u8>, GoogleApiError> {
            Ok(Vec::new())
        }
    }

    struct StubSheet {
        headers: Vec<String>,
        rows: Mutex<Vec<Vec<String>>>,
        highlights: Mutex<Vec<(usize, Vec<usize>)>>,
    }

    impl StubSheet {
        fn new(headers: &[&str], rows: Vec<Vec<String>>) -> Self {
            Self {
                headers: headers.iter().map(|h| h.to_string()).collect(),
                rows: Mutex::new(rows),
                highlights: Mutex::new(Vec::new()),
            }
        }

        fn rows(&self) -> Vec<Vec<String>> {
            self.rows.lock().unwrap().clone()
        }

        fn highlights(&self) -> Vec<(usize, Vec<usize>)> {
            self.highlights.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OpportunitySheet for StubSheet {
        async fn thread_id_column(&self) -> Result<Vec<String>, GoogleApiError> {
            Ok(self
                .rows()
                .iter()
                .map(|r| r.first().cloned().unwrap_or_default())
                .collect())
        }

        async fn header_row(&self) -> Result<Vec<String>, GoogleApiError> {
            Ok(self.headers.clone())
        }

        async fn row_values(&self, row: usize) -> Result<Vec<String>, GoogleApiError> {
            Ok(self
                .rows()
                .get(row - FIRST_DATA_ROW)
                .cloned()
                .unwrap_or_default())
        }

        async fn append_row(&self, values: &[String]) -> Result<(), GoogleApiError> {
            self.rows.lock().unwrap().push(values.to_vec());
            Ok(())
        }

        async fn update_row(&self, row: usize, values: &[String]) -> Result<(), GoogleApiError> {
            self.rows.lock().unwrap()[row - FIRST_DATA_ROW] = values.to_vec();
            Ok(())
        }

        async fn highlight_cells(&self, row: usize, columns: &[usize]) -> Result<(), GoogleApiError> {
            self.highlights.lock().unwrap().push((row, columns.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn test_compose_query_with_self_filter() {
        assert_eq!(
            compose_query("newer_than:1h", Some("me@example.com")),
            "newer_than:1h -from:me@example.com"
        );
    }

    #[test]
    fn test_compose_query_without_self_filter() {
        assert_eq!(compose_query("newer_than:2d", None), "newer_than:2d");
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(
            MessageOutcome::Filtered(Rejection::UntrustedSender).to_string(),
            "filtered (sender domain not trusted)"
        );
        assert_eq!(MessageOutcome::Added.to_string(), "new opportunity recorded");
    }

    #[tokio::test]
    async fn test_untrusted_sender_makes_no_model_call() {
        let config = test_config();
        let model = ScriptedModel::with_replies(&[]);
        let mailbox = StubMailbox::with_emails(vec![email(
            "m1",
            "T1",
            "Spam <spam@external.com>",
            "Internship offer!!",
            "we are hiring, internship open now",
        )]);
        let sheet = StubSheet::new(&["Thread ID"], Vec::new());
        let mut known = Vec::new();
        let mut summary = RunSummary::default();

        let outcome = process_message(
            &config, &model, &mailbox, &sheet, &mut known, &mut summary, "m1",
        )
        .await
        .unwrap();

        assert_eq!(outcome, MessageOutcome::Filtered(Rejection::UntrustedSender));
        assert!(model.prompts().is_empty());
        assert!(sheet.rows().is_empty());
        assert!(summary.is_empty());
    }

    #[tokio::test]
    async fn test_keyword_miss_makes_no_model_call() {
        let config = test_config();
        let model = ScriptedModel::with_replies(&[]);
        let mailbox = StubMailbox::with_emails(vec![email(
            "m1",
            "T1",
            "Newsletter <news@iitm.ac.in>",
            "Weekly campus digest",
            "upcoming talks and shows",
        )]);
        let sheet = StubSheet::new(&["Thread ID"], Vec::new());
        let mut known = Vec::new();
        let mut summary = RunSummary::default();

        let outcome = process_message(
            &config, &model, &mailbox, &sheet, &mut known, &mut summary, "m1",
        )
        .await
        .unwrap();

        assert_eq!(outcome, MessageOutcome::Filtered(Rejection::NoKeywordMatch));
        assert!(model.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_new_thread_appends_row_and_queues_notification() {
        let config = test_config();
        let model = ScriptedModel::with_replies(&[
            "YES",
            r#"{
                "Application Deadline": "2025-08-01",
                "Institution/Company": "IIT Madras",
                "Role Title": "Research Intern",
                "Relevance Score (1-10)": "8/10"
            }"#,
        ]);
        let mailbox = StubMailbox::with_emails(vec![email(
            "m1",
            "T1",
            "Recruiter <recruiter@iitm.ac.in>",
            "Research Internship opening",
            "internship at our lab, apply soon",
        )]);
        let sheet = StubSheet::new(&["Thread ID"], Vec::new());
        let mut known = Vec::new();
        let mut summary = RunSummary::default();

        let outcome = process_message(
            &config, &model, &mailbox, &sheet, &mut known, &mut summary, "m1",
        )
        .await
        .unwrap();

        assert_eq!(outcome, MessageOutcome::Added);
        let rows = sheet.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], "T1");
        assert_eq!(rows[0][2], "2025-08-01");
        assert_eq!(rows[0][17], "8"); // "/10" suffix normalized away
        assert_eq!(known, vec!["T1"]);
        assert_eq!(summary.new_opportunities.len(), 1);
        assert!(summary.updates.is_empty());
        // Classifier first, then one extraction call.
        assert_eq!(model.prompts().len(), 2);
    }

    #[tokio::test]
    async fn test_followup_changes_only_the_stated_field() {
        let config = test_config();
        let model = ScriptedModel::with_replies(&[
            "YES",
            r#"{"Application Deadline": "2025-08-01"}"#,
        ]);
        let mailbox = StubMailbox::with_emails(vec![email(
            "m2",
            "T1",
            "Recruiter <recruiter@iitm.ac.in>",
            "Re: Research Internship opening",
            "internship deadline extended",
        )]);
        let sheet = StubSheet::new(
            &["Thread ID", "Application Deadline", "Location"],
            vec![vec![
                "T1".to_string(),
                "2025-07-01".to_string(),
                "Chennai".to_string(),
            ]],
        );
        let mut known = vec!["T1".to_string()];
        let mut summary = RunSummary::default();

        let outcome = process_message(
            &config, &model, &mailbox, &sheet, &mut known, &mut summary, "m2",
        )
        .await
        .unwrap();

        assert_eq!(outcome, MessageOutcome::Updated);
        let rows = sheet.rows();
        assert_eq!(rows[0], vec!["T1", "2025-08-01", "Chennai"]);
        // Only the deadline cell (column 2 of sheet row 4) was highlighted.
        assert_eq!(sheet.highlights(), vec![(FIRST_DATA_ROW, vec![2])]);
        assert_eq!(summary.updates.len(), 1);
        assert_eq!(summary.updates[0].changed, vec!["Application Deadline"]);
        assert!(summary.new_opportunities.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_followup_writes_nothing() {
        let config = test_config();
        let model = ScriptedModel::with_replies(&["YES", "{}"]);
        let mailbox = StubMailbox::with_emails(vec![email(
            "m3",
            "T1",
            "Recruiter <recruiter@iitm.ac.in>",
            "Re: Research Internship opening",
            "internship reminder",
        )]);
        let sheet = StubSheet::new(
            &["Thread ID", "Application Deadline"],
            vec![vec!["T1".to_string(), "2025-07-01".to_string()]],
        );
        let mut known = vec!["T1".to_string()];
        let mut summary = RunSummary::default();

        let outcome = process_message(
            &config, &model, &mailbox, &sheet, &mut known, &mut summary, "m3",
        )
        .await
        .unwrap();

        assert_eq!(outcome, MessageOutcome::Unchanged);
        assert_eq!(sheet.rows()[0], vec!["T1", "2025-07-01"]);
        assert!(sheet.highlights().is_empty());
        assert!(summary.is_empty());
    }

    #[tokio::test]
    async fn test_processed_id_skipped_before_any_provider_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.json");
        std::fs::write(&path, r#"["m1"]"#).unwrap();
        let mut store = ProcessedStore::load(&path, 7);

        let config = test_config();
        let model = ScriptedModel::with_replies(&[]);
        let mailbox = StubMailbox::with_emails(vec![email(
            "m1",
            "T1",
            "Recruiter <recruiter@iitm.ac.in>",
            "Research Internship opening",
            "internship at our lab",
        )]);
        let sheet = StubSheet::new(&["Thread ID"], Vec::new());

        let summary = run_cycle(&config, &model, &mailbox, &sheet, &mut store)
            .await
            .unwrap();

        assert!(summary.is_empty());
        assert!(mailbox.metadata_calls().is_empty());
        assert!(model.prompts().is_empty());
        assert!(sheet.rows().is_empty());
    }
}
