//! Workbook adapters plus the header / entity / column inference engine.

use std::fs;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Range, Reader};
use fleet_core::{CellValue, ColumnMap, EntityType, HeaderCandidate, IngestError, RawGrid, Sheet};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub mod classify;
pub mod coerce;
pub mod header;
pub mod mapping;
pub mod schema;

pub use classify::{classify, score_entities, EntityScore, MIN_SIGNATURE_HITS};
pub use coerce::{build_draft, coerce, map_status, parse_date_text, parse_number_text, serial_to_date};
pub use header::locate;
pub use mapping::{detect_column_shift, is_passthrough_label, looks_like_code, map_columns};
pub use schema::{EntitySchema, FieldKind, ForeignKey, LegacyShape, SchemaRegistry};

pub const CRATE_NAME: &str = "fleet-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unsupported workbook extension `{0}`")]
    UnsupportedExtension(String),
    #[error("{0}")]
    Decode(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn into_ingest(self, path: &Path) -> IngestError {
        IngestError::FileReadFailure {
            path: path.display().to_string(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
    /// Hex sha256 of the file bytes.
    pub fingerprint: String,
}

pub trait WorkbookAdapter: Send + Sync {
    fn adapter_id(&self) -> &'static str;
    fn supports_extension(&self, ext: &str) -> bool;
    fn read(&self, path: &Path) -> Result<Workbook, AdapterError>;
}

pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Default)]
pub struct CalamineAdapter;

fn convert_cell(cell: &Data) -> CellValue {
    match cell {
        Data::Empty => CellValue::Empty,
        Data::String(s) => CellValue::text(s.as_str()),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) if dt.is_duration() => CellValue::Number(dt.as_f64()),
        Data::DateTime(dt) => serial_to_date(dt.as_f64())
            .map(CellValue::Date)
            .unwrap_or(CellValue::Number(dt.as_f64())),
        Data::DateTimeIso(s) => parse_date_text(s)
            .map(CellValue::Date)
            .unwrap_or_else(|| CellValue::text(s.as_str())),
        Data::DurationIso(s) => CellValue::text(s.as_str()),
        Data::Error(_) => CellValue::Empty,
    }
}

/// Re-anchors a calamine range at A1 so row and column indices match the sheet.
fn range_to_grid(range: &Range<Data>) -> RawGrid {
    let (start_row, start_col) = range
        .start()
        .map(|(r, c)| (r as usize, c as usize))
        .unwrap_or((0, 0));
    let mut rows = vec![Vec::new(); start_row];
    for row in range.rows() {
        let mut cells = vec![CellValue::Empty; start_col];
        cells.extend(row.iter().map(convert_cell));
        rows.push(cells);
    }
    RawGrid::new(rows)
}

impl WorkbookAdapter for CalamineAdapter {
    fn adapter_id(&self) -> &'static str {
        "calamine"
    }

    fn supports_extension(&self, ext: &str) -> bool {
        matches!(ext.to_ascii_lowercase().as_str(), "xlsx" | "xlsm" | "xlsb" | "xls" | "ods")
    }

    fn read(&self, path: &Path) -> Result<Workbook, AdapterError> {
        let bytes = fs::read(path)?;
        let mut workbook =
            open_workbook_auto(path).map_err(|err| AdapterError::Decode(err.to_string()))?;
        let mut sheets = Vec::new();
        for name in workbook.sheet_names() {
            let range = workbook
                .worksheet_range(&name)
                .map_err(|err| AdapterError::Decode(format!("sheet `{name}`: {err}")))?;
            debug!(sheet = %name, rows = range.height(), "sheet loaded");
            sheets.push(Sheet {
                grid: range_to_grid(&range),
                name,
            });
        }
        Ok(Workbook {
            sheets,
            fingerprint: fingerprint(&bytes),
        })
    }
}

#[derive(Debug, Default)]
pub struct CsvAdapter;

impl WorkbookAdapter for CsvAdapter {
    fn adapter_id(&self) -> &'static str {
        "csv"
    }

    fn supports_extension(&self, ext: &str) -> bool {
        ext.eq_ignore_ascii_case("csv")
    }

    fn read(&self, path: &Path) -> Result<Workbook, AdapterError> {
        let bytes = fs::read(path)?;
        let body = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(&bytes);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(body);
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| AdapterError::Decode(err.to_string()))?;
            rows.push(record.iter().map(CellValue::text).collect());
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "Sheet1".to_string());
        Ok(Workbook {
            sheets: vec![Sheet {
                name,
                grid: RawGrid::new(rows),
            }],
            fingerprint: fingerprint(&bytes),
        })
    }
}

pub fn adapter_for_path(path: &Path) -> Option<Box<dyn WorkbookAdapter>> {
    let ext = path.extension()?.to_str()?;
    let adapters: Vec<Box<dyn WorkbookAdapter>> = vec![Box::new(CalamineAdapter), Box::new(CsvAdapter)];
    adapters.into_iter().find(|a| a.supports_extension(ext))
}

pub fn read_workbook(path: &Path) -> Result<Workbook, IngestError> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    let adapter = adapter_for_path(path)
        .ok_or_else(|| AdapterError::UnsupportedExtension(ext).into_ingest(path))?;
    adapter.read(path).map_err(|err| err.into_ingest(path))
}

/// How a sheet's entity type is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EntityMode {
    Fixed { entity: EntityType },
    Detect { default: Option<EntityType> },
}

/// Everything decided about a sheet before any data row is read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SheetPlan {
    pub entity: EntityType,
    pub header: HeaderCandidate,
    pub column_map: ColumnMap,
    /// Columns the data was moved right by, when the shift check fired.
    pub column_shift: Option<usize>,
}

impl SheetPlan {
    pub fn first_data_row(&self) -> usize {
        self.header.row_index + 1
    }
}

pub fn plan_sheet(
    grid: &RawGrid,
    registry: &SchemaRegistry,
    mode: EntityMode,
) -> Result<SheetPlan, IngestError> {
    let (header, entity) = match mode {
        EntityMode::Fixed { entity } => (locate(grid, registry, Some(entity))?, entity),
        EntityMode::Detect { default } => {
            let header = locate(grid, registry, None)?;
            let entity = classify(&header.labels, registry, default)?;
            (header, entity)
        }
    };
    let schema = registry.schema(entity);
    let mapped = map_columns(&header.raw_labels, schema);
    let column_shift = detect_column_shift(grid, header.row_index, &mapped, schema);
    let column_map = match column_shift {
        Some(offset) => mapped.shifted(offset),
        None => mapped,
    };
    Ok(SheetPlan {
        entity,
        header,
        column_map,
        column_shift,
    })
}
