//! Knowledge sources and row validation.
//!
//! A [`DocumentSource`] returns the complete, authoritative set of knowledge
//! rows in one call. Rows are untyped column → cell maps until
//! [`parse_row`] turns each into a typed [`SourceDocument`], an inactive
//! (soft-deleted) marker, or a rejection with a reason.
//!
//! # Column mapping
//!
//! | Column | Required | Notes |
//! |--------|----------|-------|
//! | `id` (`doc_id`, `docid`) | yes | non-blank |
//! | `content` | yes | non-blank |
//! | `title` | no | |
//! | `category` | no | |
//! | `tags` | no | comma or semicolon separated |
//! | `active` | no | `false`, `no`, `0` ⇒ row treated as absent |
//!
//! Column names are matched case-insensitively after trimming.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use support_harness_core::models::SourceDocument;

use crate::config::SourceConfig;

/// One spreadsheet row: normalized (lowercase, trimmed) column name → cell.
pub type SourceRow = BTreeMap<String, String>;

#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch every row. Any error aborts the synchronization pass before
    /// anything is mutated.
    async fn fetch_all(&self) -> Result<Vec<SourceRow>>;
}

pub fn create_source(config: &SourceConfig) -> Result<Arc<dyn DocumentSource>> {
    match config.kind.as_str() {
        "google_sheets" => Ok(Arc::new(GoogleSheetsSource::from_config(config)?)),
        "json_file" => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("source.path required for json_file"))?;
            Ok(Arc::new(JsonFileSource::new(path)))
        }
        other => bail!("Unknown source kind: {}", other),
    }
}

/// Result of validating one row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Document(SourceDocument),
    /// The row is soft-deleted; its document is treated as removed.
    Inactive { doc_id: String },
    Rejected {
        /// Present when the row had a usable id, so its prior state can be
        /// kept.
        doc_id: Option<String>,
        reason: String,
    },
}

/// Build a row from `(column, cell)` pairs, normalizing column names.
pub fn row_from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> SourceRow
where
    K: AsRef<str>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.as_ref().trim().to_lowercase(), v.into()))
        .collect()
}

/// Validate a row and convert it into a typed document.
pub fn parse_row(row: &SourceRow) -> RowOutcome {
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|n| row.get(*n))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    };

    let Some(doc_id) = field(&["id", "doc_id", "docid"]) else {
        return RowOutcome::Rejected {
            doc_id: None,
            reason: "missing required field: id".to_string(),
        };
    };

    if let Some(active) = field(&["active"]) {
        if matches!(active.to_lowercase().as_str(), "false" | "no" | "0") {
            return RowOutcome::Inactive {
                doc_id: doc_id.to_string(),
            };
        }
    }

    let Some(content) = field(&["content"]) else {
        return RowOutcome::Rejected {
            doc_id: Some(doc_id.to_string()),
            reason: "missing required field: content".to_string(),
        };
    };

    let tags: Vec<&str> = field(&["tags"])
        .map(|t| {
            t.split([',', ';'])
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    RowOutcome::Document(SourceDocument::new(
        doc_id,
        field(&["title"]).unwrap_or_default(),
        content,
        field(&["category"]).unwrap_or_default(),
        tags,
    ))
}

/// Render a JSON cell as the string a spreadsheet would show.
fn cell_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(cell_to_string)
                .collect::<Vec<_>>()
                .join(","),
        ),
        other => Some(other.to_string()),
    }
}

// ============ Google Sheets ============

/// Reads one worksheet through the Sheets API v4 `values` endpoint.
///
/// The first row is the header; later rows are mapped by column position.
/// Trailing empty cells (which the API omits) are treated as blank.
pub struct GoogleSheetsSource {
    client: reqwest::Client,
    url: String,
    spreadsheet_id: String,
    worksheet: String,
    api_key: Option<String>,
}

impl GoogleSheetsSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let spreadsheet_id = config
            .spreadsheet_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("source.spreadsheet_id required"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            spreadsheet_id,
            worksheet: config.worksheet.clone(),
            api_key: std::env::var(&config.api_key_env).ok(),
        })
    }
}

#[async_trait]
impl DocumentSource for GoogleSheetsSource {
    fn name(&self) -> &str {
        "google_sheets"
    }

    async fn fetch_all(&self) -> Result<Vec<SourceRow>> {
        let url = values_url(&self.url, &self.spreadsheet_id, &self.worksheet)?;
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key)]);
        }

        let response = request
            .send()
            .await
            .context("Google Sheets request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Google Sheets API error {}: {}", status, body);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .context("Google Sheets returned invalid JSON")?;
        rows_from_values(&json)
    }
}

/// `{base}/spreadsheets/{id}/values/{worksheet}`, each part encoded as one
/// path segment.
fn values_url(base: &str, spreadsheet_id: &str, worksheet: &str) -> Result<reqwest::Url> {
    let mut url = reqwest::Url::parse(base)
        .with_context(|| format!("invalid Google Sheets url: {}", base))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Google Sheets url cannot take a path: {}", base))?
        .pop_if_empty()
        .extend(["spreadsheets", spreadsheet_id, "values", worksheet]);
    Ok(url)
}

/// Convert a `values` response (`{"values": [[header...], [cells...]]}`)
/// into rows.
pub fn rows_from_values(json: &serde_json::Value) -> Result<Vec<SourceRow>> {
    let Some(values) = json.get("values") else {
        // An empty worksheet has no "values" key at all.
        return Ok(Vec::new());
    };
    let values = values
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Google Sheets response: values is not an array"))?;

    let mut rows = values.iter().map(|row| {
        row.as_array()
            .map(|cells| cells.iter().map(|c| cell_to_string(c).unwrap_or_default()).collect())
            .unwrap_or_else(Vec::<String>::new)
    });

    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };

    Ok(rows
        .filter(|cells| cells.iter().any(|c| !c.trim().is_empty()))
        .map(|cells| {
            row_from_pairs(
                header
                    .iter()
                    .enumerate()
                    .filter(|(_, name)| !name.trim().is_empty())
                    .map(|(i, name)| (name.as_str(), cells.get(i).cloned().unwrap_or_default())),
            )
        })
        .collect())
}

// ============ JSON file ============

/// Reads a JSON array of row objects from a local file.
///
/// Array-valued cells (e.g. `"tags": ["a", "b"]`) are joined with commas.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DocumentSource for JsonFileSource {
    fn name(&self) -> &str {
        "json_file"
    }

    async fn fetch_all(&self) -> Result<Vec<SourceRow>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read knowledge file: {}", self.path.display()))?;
        let json: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in {}", self.path.display()))?;
        rows_from_objects(&json)
    }
}

fn rows_from_objects(json: &serde_json::Value) -> Result<Vec<SourceRow>> {
    let items = json
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("knowledge file must contain a JSON array"))?;

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let object = item
                .as_object()
                .ok_or_else(|| anyhow::anyhow!("row {} is not an object", i))?;
            Ok(row_from_pairs(object.iter().filter_map(|(k, v)| {
                cell_to_string(v).map(|cell| (k.as_str(), cell))
            })))
        })
        .collect()
}
