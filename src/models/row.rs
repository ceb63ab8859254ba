//! Row-level data: the submitted dataset and the per-task working set.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;

use super::{AuditError, Result};

/// One input row, column name → cell value. Key order is preserved.
pub type Record = serde_json::Map<String, Value>;

/// Anything that exposes named columns over a sequence of records.
pub trait Table {
    fn columns(&self) -> &[String];
    fn records(&self) -> Box<dyn Iterator<Item = &Record> + '_>;
    fn row_count(&self) -> usize;
}

/// A validated row source as submitted by the operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

/// On-disk shape accepted for a dataset document.
#[derive(Deserialize)]
#[serde(untagged)]
enum DatasetDocument {
    Table {
        #[serde(default)]
        columns: Vec<String>,
        rows: Vec<Record>,
    },
    Rows(Vec<Record>),
}

impl Dataset {
    /// Build a dataset from rows, deriving column order from first appearance.
    pub fn from_rows(rows: Vec<Record>) -> Self {
        Self::with_columns(Vec::new(), rows)
    }

    /// Build a dataset, trimming header names and appending any column the
    /// declared list misses.
    pub fn with_columns(columns: Vec<String>, rows: Vec<Record>) -> Self {
        let mut ordered: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !ordered.iter().any(|c| c == name) {
                ordered.push(name.to_string());
            }
        };
        for column in &columns {
            push(column.trim());
        }

        let rows: Vec<Record> = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|(k, v)| (k.trim().to_string(), v))
                    .collect::<Record>()
            })
            .collect();
        for row in &rows {
            for key in row.keys() {
                push(key);
            }
        }

        Self {
            columns: ordered,
            rows,
        }
    }

    /// Load a dataset from a `.json` document or a `.jsonl` file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AuditError::io(format!("reading dataset {}", path.display()), e))?;

        let is_lines = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("jsonl"));

        if is_lines {
            return Self::from_json_lines(&content);
        }

        let document: DatasetDocument = serde_json::from_str(&content)
            .map_err(|e| AuditError::ParseError(format!("Invalid dataset: {e}")))?;
        Ok(match document {
            DatasetDocument::Table { columns, rows } => Self::with_columns(columns, rows),
            DatasetDocument::Rows(rows) => Self::from_rows(rows),
        })
    }

    /// Parse one JSON object per line, skipping blank lines.
    pub fn from_json_lines(content: &str) -> Result<Self> {
        let mut rows = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row: Record = serde_json::from_str(line)
                .map_err(|e| AuditError::ParseError(format!("Line {}: {}", line_num + 1, e)))?;
            rows.push(row);
        }
        Ok(Self::from_rows(rows))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The first `n` rows, same columns.
    pub fn head(&self, n: usize) -> Dataset {
        Dataset {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }
}

impl Table for Dataset {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn records(&self) -> Box<dyn Iterator<Item = &Record> + '_> {
        Box::new(self.rows.iter())
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Outcome of comparing a claim against its evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchVerdict {
    Matched,
    Mismatched,
    Unknown,
}

impl MatchVerdict {
    pub fn from_flag(flag: Option<bool>) -> Self {
        match flag {
            Some(true) => Self::Matched,
            Some(false) => Self::Mismatched,
            None => Self::Unknown,
        }
    }

    pub fn is_matched(self) -> bool {
        self == Self::Matched
    }
}

impl fmt::Display for MatchVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::Mismatched => write!(f, "mismatched"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result fields written back into a row by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowResult {
    /// Amount the service read from the evidence
    pub extracted_amount: Option<f64>,
    pub verdict: MatchVerdict,
    /// Empty when matched, otherwise the reason
    #[serde(default)]
    pub note: String,
    /// External calls spent on this row
    #[serde(default)]
    pub attempts: u32,
}

/// A row of the working set: input fields plus an optional result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRow {
    pub fields: Record,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RowResult>,
}

impl AuditRow {
    pub fn is_processed(&self) -> bool {
        self.result.is_some()
    }

    pub fn is_ok(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.verdict.is_matched())
    }

    pub fn is_bad(&self) -> bool {
        self.result.as_ref().is_some_and(|r| !r.verdict.is_matched())
    }
}

/// The mutable, per-task row sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingSet {
    pub columns: Vec<String>,
    pub rows: Vec<AuditRow>,
}

impl WorkingSet {
    /// Take the first `total` rows of the source, with empty results.
    pub fn from_source(source: &Dataset, total: usize) -> Self {
        Self {
            columns: source.columns.clone(),
            rows: source
                .rows
                .iter()
                .take(total)
                .map(|fields| AuditRow {
                    fields: fields.clone(),
                    result: None,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ok_count(&self) -> usize {
        self.rows.iter().filter(|r| r.is_ok()).count()
    }

    pub fn bad_count(&self) -> usize {
        self.rows.iter().filter(|r| r.is_bad()).count()
    }

    /// Paginated listing filtered by scope. `page` is clamped into range.
    pub fn page(&self, scope: RowScope, page: usize, page_size: usize) -> RowPage {
        let page_size = page_size.max(1);
        let selected: Vec<(usize, &AuditRow)> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| match scope {
                RowScope::All => true,
                RowScope::Processed => row.is_processed(),
                RowScope::Pending => !row.is_processed(),
            })
            .collect();

        let total_rows = selected.len();
        let total_pages = total_rows.div_ceil(page_size).max(1);
        let page = page.clamp(1, total_pages);
        let rows = selected
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .map(|(idx, row)| ListedRow {
                row_no: idx + 1,
                fields: row.fields.clone(),
                result: row.result.clone(),
            })
            .collect();

        RowPage {
            scope,
            total_rows,
            page,
            page_size,
            total_pages,
            columns: self.columns.clone(),
            rows,
        }
    }
}

impl Table for WorkingSet {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn records(&self) -> Box<dyn Iterator<Item = &Record> + '_> {
        Box::new(self.rows.iter().map(|r| &r.fields))
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Row listing filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowScope {
    #[default]
    All,
    Processed,
    Pending,
}

impl FromStr for RowScope {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Ok(Self::All),
            "processed" => Ok(Self::Processed),
            "pending" => Ok(Self::Pending),
            other => Err(AuditError::InvalidInput(format!(
                "unknown row scope '{other}' (expected all, processed or pending)"
            ))),
        }
    }
}

impl fmt::Display for RowScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Processed => write!(f, "processed"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

/// One page of a row listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowPage {
    pub scope: RowScope,
    pub total_rows: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub columns: Vec<String>,
    pub rows: Vec<ListedRow>,
}

/// A listed row with its 1-based position in the working set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedRow {
    pub row_no: usize,
    pub fields: Record,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RowResult>,
}

static MONEY_NOISE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"[^0-9.\-]").expect("valid money pattern"));

/// Parse a claimed amount such as `"￥12.50"`, `"8元"` or `6`.
pub fn parse_money(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => parse_money_text(s),
        _ => None,
    }
}

/// Text form of [`parse_money`].
pub fn parse_money_text(text: &str) -> Option<f64> {
    let mut text = text.trim().to_string();
    for token in ["￥", "¥", "元", ",", "，", " "] {
        text = text.replace(token, "");
    }
    let clean = MONEY_NOISE.replace_all(&text, "");
    if matches!(clean.as_ref(), "" | "." | "-" | "-.") {
        return None;
    }
    clean.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Plain text of a cell, for display and evidence extraction.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}
