//! Google Sheets v4 client for the opportunity tracker spreadsheet.
//!
//! All ranges are addressed without a sheet title and therefore target the
//! spreadsheet's first sheet. The numeric sheet id needed for formatting
//! requests is resolved once when the client is opened.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{send_with_retry, GoogleApiError, RetryPolicy};
use crate::record::{FIRST_DATA_ROW, HEADER_ROW};

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

/// Spreadsheet operations the reconciler drives, as a seam for scripted stubs.
#[async_trait]
pub trait OpportunitySheet: Send + Sync {
    /// Thread-id column values for every data row, top to bottom.
    async fn thread_id_column(&self) -> Result<Vec<String>, GoogleApiError>;
    /// The header row naming each column.
    async fn header_row(&self) -> Result<Vec<String>, GoogleApiError>;
    /// All cell values of one 1-based row.
    async fn row_values(&self, row: usize) -> Result<Vec<String>, GoogleApiError>;
    /// Append a row to the data region below the headers.
    async fn append_row(&self, values: &[String]) -> Result<(), GoogleApiError>;
    /// Overwrite one 1-based row starting at column A.
    async fn update_row(&self, row: usize, values: &[String]) -> Result<(), GoogleApiError>;
    /// Flag freshly merged cells. `columns` are 1-based within the 1-based `row`.
    async fn highlight_cells(&self, row: usize, columns: &[usize]) -> Result<(), GoogleApiError>;
}

// ============================================================================
// Client
// ============================================================================

pub struct SheetsClient {
    client: reqwest::Client,
    access_token: String,
    spreadsheet_id: String,
    /// Numeric id of the first sheet, for batchUpdate formatting.
    sheet_id: i64,
    retry: RetryPolicy,
}

impl SheetsClient {
    /// Connect to the spreadsheet and resolve its first sheet.
    pub async fn open(
        client: reqwest::Client,
        access_token: String,
        spreadsheet_id: &str,
    ) -> Result<Self, GoogleApiError> {
        let request = client
            .get(format!("{}/{}", SHEETS_API_BASE, spreadsheet_id))
            .bearer_auth(&access_token)
            .query(&[("fields", "sheets.properties")]);

        let retry = RetryPolicy::default();
        let response = send_with_retry(request, &retry).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GoogleApiError::ApiError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let meta: SpreadsheetMeta = response.json().await?;
        let first = meta.sheets.first().ok_or(GoogleApiError::ApiError {
            status: 200,
            message: "spreadsheet has no sheets".to_string(),
        })?;
        log::debug!(
            "opened sheet '{}' (id {})",
            first.properties.title,
            first.properties.sheet_id
        );

        Ok(Self {
            client,
            access_token,
            spreadsheet_id: spreadsheet_id.to_string(),
            sheet_id: first.properties.sheet_id,
            retry,
        })
    }

    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, GoogleApiError> {
        let request = self
            .client
            .get(format!(
                "{}/{}/values/{}",
                SHEETS_API_BASE, self.spreadsheet_id, range
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

        let range: ValueRange = response.json().await?;
        Ok(range.values.into_iter().map(coerce_row).collect())
    }
}

#[async_trait]
impl OpportunitySheet for SheetsClient {
    async fn thread_id_column(&self) -> Result<Vec<String>, GoogleApiError> {
        let rows = self.get_values(&format!("A{}:A", FIRST_DATA_ROW)).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_iter().next().unwrap_or_default())
            .collect())
    }

    async fn header_row(&self) -> Result<Vec<String>, GoogleApiError> {
        let mut rows = self
            .get_values(&format!("{row}:{row}", row = HEADER_ROW))
            .await?;
        Ok(if rows.is_empty() {
            Vec::new()
        } else {
            rows.remove(0)
        })
    }

    async fn row_values(&self, row: usize) -> Result<Vec<String>, GoogleApiError> {
        let mut rows = self.get_values(&format!("{row}:{row}")).await?;
        Ok(if rows.is_empty() {
            Vec::new()
        } else {
            rows.remove(0)
        })
    }

    async fn append_row(&self, values: &[String]) -> Result<(), GoogleApiError> {
        let request = self
            .client
            .post(format!(
                "{}/{}/values/A{}:append",
                SHEETS_API_BASE, self.spreadsheet_id, FIRST_DATA_ROW
            ))
            .bearer_auth(&self.access_token)
            .query(&[("valueInputOption", "USER_ENTERED")])
            .json(&json!({ "values": [values] }));

        let response = send_with_retry(request, &self.retry).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GoogleApiError::ApiError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn update_row(&self, row: usize, values: &[String]) -> Result<(), GoogleApiError> {
        let request = self
            .client
            .put(format!(
                "{}/{}/values/A{}",
                SHEETS_API_BASE, self.spreadsheet_id, row
            ))
            .bearer_auth(&self.access_token)
            .query(&[("valueInputOption", "USER_ENTERED")])
            .json(&json!({ "values": [values] }));

        let response = send_with_retry(request, &self.retry).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GoogleApiError::ApiError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Renders as red text via a `repeatCell` batchUpdate.
    async fn highlight_cells(&self, row: usize, columns: &[usize]) -> Result<(), GoogleApiError> {
        if columns.is_empty() {
            return Ok(());
        }

        let requests: Vec<serde_json::Value> = columns
            .iter()
            .map(|&col| {
                json!({
                    "repeatCell": {
                        "range": {
                            "sheetId": self.sheet_id,
                            "startRowIndex": row - 1,
                            "endRowIndex": row,
                            "startColumnIndex": col - 1,
                            "endColumnIndex": col
                        },
                        "cell": {
                            "userEnteredFormat": {
                                "textFormat": {
                                    "foregroundColor": { "red": 1.0 }
                                }
                            }
                        },
                        "fields": "userEnteredFormat(textFormat)"
                    }
                })
            })
            .collect();

        let request = self
            .client
            .post(format!(
                "{}/{}:batchUpdate",
                SHEETS_API_BASE, self.spreadsheet_id
            ))
            .bearer_auth(&self.access_token)
            .json(&json!({ "requests": requests }));

        let response = send_with_retry(request, &self.retry).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GoogleApiError::ApiError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Sheets cell values can come back as numbers or bools; work in strings.
fn coerce_row(row: Vec<serde_json::Value>) -> Vec<String> {
    row.into_iter()
        .map(|value| match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect()
}

/// Locate a thread id in the thread-id column, returning its 1-based sheet
/// row. Column order mirrors the sheet's data region. An empty thread id is
/// never found, so it cannot match a blank cell in the column.
pub fn locate_thread_row(thread_ids: &[String], thread_id: &str) -> Option<usize> {
    if thread_id.is_empty() {
        return None;
    }
    thread_ids
        .iter()
        .position(|id| id == thread_id)
        .map(|index| FIRST_DATA_ROW + index)
}
