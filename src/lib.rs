//! Email triage agent for career opportunities.
//!
//! Each run polls a Gmail mailbox for recent messages, filters them down to
//! genuine career opportunities (trusted sender, keyword match, model check),
//! extracts structured fields with Gemini, and reconciles them into a Google
//! Sheet keyed by mail thread. New threads become new rows; follow-up emails
//! merge into the existing row with changed cells highlighted. A Telegram
//! summary closes the run. A small retention store of processed message ids
//! keeps repeated runs idempotent.

pub mod attachments;
pub mod classify;
pub mod config;
pub mod extract;
pub mod gemini;
pub mod google_api;
pub mod notify;
pub mod reconcile;
pub mod record;
pub mod retention;
pub mod telegram;
