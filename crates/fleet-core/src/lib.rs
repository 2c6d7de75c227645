//! Core workbook and canonical-record model for fleet sync.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "fleet-core";

/// Untyped scalar read from a spreadsheet cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
}

static EMPTY_CELL: CellValue = CellValue::Empty;

impl CellValue {
    /// Text cell; blank input collapses to `Empty`.
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            Self::Empty
        } else {
            Self::Text(value)
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Display form used for header labels and identifier coercion.
    pub fn display_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(s) => s.trim().to_string(),
            Self::Number(n) => format_number(*n),
            Self::Bool(b) => b.to_string(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::text(value)
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        Self::text(value)
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

/// Renders integral floats without a fractional part (`1234.0` -> `1234`).
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Row-major grid of cells for one sheet. Rows may be ragged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawGrid {
    rows: Vec<Vec<CellValue>>,
}

impl RawGrid {
    pub fn new(rows: Vec<Vec<CellValue>>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&[CellValue]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn cell(&self, row: usize, column: usize) -> &CellValue {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .unwrap_or(&EMPTY_CELL)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    pub grid: RawGrid,
}

/// Closed set of entity categories a sheet can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Machine,
    MaintenanceStandard,
    MaintenanceHistory,
    ProjectMapping,
    Parts,
    ErrorCodes,
    DailyLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Idempotent write keyed on the natural code.
    Upsert,
    /// Append-only; re-imports duplicate rows.
    Insert,
}

impl EntityType {
    /// Fixed order; also the classifier's tie-break order.
    pub const ALL: [EntityType; 7] = [
        EntityType::Machine,
        EntityType::MaintenanceStandard,
        EntityType::MaintenanceHistory,
        EntityType::ProjectMapping,
        EntityType::Parts,
        EntityType::ErrorCodes,
        EntityType::DailyLog,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Machine => "machine",
            Self::MaintenanceStandard => "maintenance_standard",
            Self::MaintenanceHistory => "maintenance_history",
            Self::ProjectMapping => "project_mapping",
            Self::Parts => "parts",
            Self::ErrorCodes => "error_codes",
            Self::DailyLog => "daily_log",
        }
    }

    /// Store collection the entity's rows are written to.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Machine | Self::ProjectMapping => "machines",
            Self::MaintenanceStandard => "maintenance_standards",
            Self::MaintenanceHistory => "maintenance_history",
            Self::Parts => "parts",
            Self::ErrorCodes => "error_codes",
            Self::DailyLog => "daily_logs",
        }
    }

    pub fn merge_mode(self) -> MergeMode {
        match self {
            Self::MaintenanceHistory | Self::DailyLog => MergeMode::Insert,
            _ => MergeMode::Upsert,
        }
    }

    pub fn is_master_data(self) -> bool {
        self.merge_mode() == MergeMode::Upsert
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown entity type `{0}`")]
pub struct UnknownEntityType(pub String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        let entity = match key.as_str() {
            "machine" | "machines" => Self::Machine,
            "maintenance_standard" | "maintenance_standards" => Self::MaintenanceStandard,
            "maintenance_history" | "maintenance_tasks" => Self::MaintenanceHistory,
            "project_mapping" | "project_mappings" => Self::ProjectMapping,
            "parts" | "part" => Self::Parts,
            "error_codes" | "error_code" => Self::ErrorCodes,
            "daily_log" | "daily_logs" => Self::DailyLog,
            _ => return Err(UnknownEntityType(s.to_string())),
        };
        Ok(entity)
    }
}

/// Coerced canonical scalar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Store representation: integral numbers become JSON integers, dates ISO strings.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => JsonValue::from(*n as i64),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            Self::Text(s) => JsonValue::String(s.clone()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => f.write_str(&format_number(*n)),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// One store row, keyed by column name.
pub type StoreRow = JsonMap<String, JsonValue>;

/// Coerced row that has not been checked against required fields yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordDraft {
    pub entity: EntityType,
    /// Zero-based grid row the draft was built from.
    pub source_row: usize,
    pub fields: BTreeMap<String, FieldValue>,
}

impl RecordDraft {
    pub fn new(entity: EntityType, source_row: usize) -> Self {
        Self {
            entity,
            source_row,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: &str, value: FieldValue) -> Self {
        self.fields.insert(field.to_string(), value);
        self
    }
}

/// Why a draft never became a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{entity} row {row}: missing required field(s) {}", .missing.join(", "))]
pub struct Rejection {
    pub entity: EntityType,
    pub row: usize,
    pub missing: Vec<String>,
}

/// Validated record; every required field is present and non-empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalRecord {
    entity: EntityType,
    source_row: usize,
    fields: BTreeMap<String, FieldValue>,
}

impl CanonicalRecord {
    pub fn try_from_draft(draft: RecordDraft, required: &[String]) -> Result<Self, Rejection> {
        let missing = required
            .iter()
            .filter(|field| match draft.fields.get(field.as_str()) {
                Some(FieldValue::Text(s)) => s.trim().is_empty(),
                Some(_) => false,
                None => true,
            })
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(Rejection {
                entity: draft.entity,
                row: draft.source_row,
                missing,
            });
        }
        Ok(Self {
            entity: draft.entity,
            source_row: draft.source_row,
            fields: draft.fields,
        })
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    pub fn source_row(&self) -> usize {
        self.source_row
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(FieldValue::as_text)
    }

    /// Replaces a text field in place; empty replacements drop the field.
    pub fn set_text(&mut self, field: &str, value: String) {
        if value.trim().is_empty() {
            self.fields.remove(field);
        } else {
            self.fields.insert(field.to_string(), FieldValue::Text(value));
        }
    }

    /// Sets a non-required link field (for example a resolved parent id).
    pub fn set_link(&mut self, field: &str, value: FieldValue) {
        self.fields.insert(field.to_string(), value);
    }

    pub fn to_row(&self) -> StoreRow {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderCandidate {
    pub row_index: usize,
    /// Normalized labels (trimmed, lower-cased, whitespace collapsed), one per column.
    pub labels: Vec<String>,
    /// Labels as written in the sheet, trimmed.
    pub raw_labels: Vec<String>,
    pub match_score: usize,
}

/// Column index -> canonical field, built once per sheet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ColumnMap {
    columns: BTreeMap<usize, String>,
}

impl ColumnMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping unless the field is already claimed by an earlier column.
    pub fn insert(&mut self, column: usize, field: impl Into<String>) -> bool {
        let field = field.into();
        if self.columns.values().any(|f| *f == field) {
            return false;
        }
        self.columns.insert(column, field);
        true
    }

    pub fn get(&self, column: usize) -> Option<&str> {
        self.columns.get(&column).map(String::as_str)
    }

    pub fn column_of(&self, field: &str) -> Option<usize> {
        self.columns
            .iter()
            .find(|(_, f)| f.as_str() == field)
            .map(|(c, _)| *c)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.columns.iter().map(|(c, f)| (*c, f.as_str()))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Same fields, every column index moved right by `offset`.
    pub fn shifted(&self, offset: usize) -> Self {
        Self {
            columns: self
                .columns
                .iter()
                .map(|(c, f)| (c + offset, f.clone()))
                .collect(),
        }
    }
}

/// Sheet- and file-level failures. Everything else is counted, not raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IngestError {
    #[error("no header row found in the first {window} rows")]
    NoHeaderFound { window: usize },
    #[error("sheet could not be classified (best signature score {best_score}, need {threshold})")]
    UnclassifiableEntity { best_score: usize, threshold: usize },
    #[error("failed to read {path}: {message}")]
    FileReadFailure { path: String, message: String },
}

/// Trim, lower-case and collapse runs of whitespace.
pub fn normalize_label(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Diacritic-insensitive label key: `"Ngày /tháng .năm"` -> `"ngay thang nam"`.
pub fn fold_label(raw: &str) -> String {
    raw.nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| match c {
            'đ' | 'Đ' => 'd',
            other => other,
        })
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
