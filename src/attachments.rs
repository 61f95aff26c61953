//! Attachment text extraction (PDF and DOCX).
//!
//! Works on bytes fetched from the mailbox — attachments are never written to
//! disk. Only `.pdf` and `.docx` are supported; everything else is ignored by
//! the caller via [`is_supported`]. A failed extraction affects only that one
//! attachment.

use std::io::Cursor;

use thiserror::Error;

/// Filename extensions the agent will fetch and decode.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[".pdf", ".docx"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported attachment type: {0}")]
    Unsupported(String),
    #[error("PDF: {0}")]
    Pdf(String),
    #[error("DOCX: {0}")]
    Docx(String),
}

/// Whether an attachment filename has a supported extension.
pub fn is_supported(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    SUPPORTED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Extract text from attachment bytes, dispatching on the filename extension.
pub fn extract_text(filename: &str, bytes: Vec<u8>) -> Result<String, ExtractError> {
    let lower = filename.to_lowercase();
    if lower.ends_with(".pdf") {
        extract_pdf(bytes)
    } else if lower.ends_with(".docx") {
        extract_docx(bytes)
    } else {
        Err(ExtractError::Unsupported(filename.to_string()))
    }
}

fn extract_pdf(bytes: Vec<u8>) -> Result<String, ExtractError> {
    // pdf-extract can panic on malformed PDFs — wrap in catch_unwind
    let result = std::panic::catch_unwind(move || pdf_extract::extract_text_from_mem(&bytes));

    match result {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(ExtractError::Pdf(e.to_string())),
        Err(_) => Err(ExtractError::Pdf(
            "extraction panicked (malformed file)".to_string(),
        )),
    }
}

fn extract_docx(bytes: Vec<u8>) -> Result<String, ExtractError> {
    // DOCX = ZIP archive containing word/document.xml.
    // Walk <w:t> tags to collect text runs, newline per paragraph.
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(format!("zip: {}", e)))?;

    let doc = archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::Docx(format!("missing document.xml: {}", e)))?;

    let mut reader = quick_xml::Reader::from_reader(std::io::BufReader::new(doc));
    let mut buf = Vec::new();
    let mut text = String::new();
    let mut in_text_tag = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(ref e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text_tag = true;
                }
            }
            Ok(quick_xml::events::Event::End(ref e)) => {
                let local = e.local_name();
                if local.as_ref() == b"t" {
                    in_text_tag = false;
                } else if local.as_ref() == b"p" && !text.ends_with('\n') && !text.is_empty() {
                    text.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Text(ref e)) => {
                if in_text_tag {
                    if let Ok(s) = e.unescape() {
                        text.push_str(&s);
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(format!("XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(text)
}
