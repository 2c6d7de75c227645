//! Cell -> canonical scalar conversion.
//!
//! Coercion never fails loudly: a value that cannot be read is absent, except
//! for quantity fields which fall back to `0`.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use fleet_core::{CellValue, ColumnMap, FieldValue, RecordDraft};
use unicode_normalization::UnicodeNormalization;

use crate::schema::{EntitySchema, FieldKind};

/// Day count of 1970-01-01 in the spreadsheet serial calendar.
const UNIX_EPOCH_SERIAL: f64 = 25569.0;
const MILLIS_PER_DAY: f64 = 86_400_000.0;
/// Serials below this are treated as noise (row numbers, small counts).
const MIN_DATE_SERIAL: f64 = 1000.0;

const NULL_MARKER: &str = "NULL";

pub fn serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < MIN_DATE_SERIAL {
        return None;
    }
    let millis = ((serial - UNIX_EPOCH_SERIAL) * MILLIS_PER_DAY).round() as i64;
    DateTime::from_timestamp_millis(millis).map(|dt| dt.date_naive())
}

fn expand_year(year: i32) -> i32 {
    match year {
        0..=99 => 2000 + year,
        100..=1999 => 2000 + year % 100,
        _ => year,
    }
}

/// `d/m/y` with `/`, `-` or `.` separators.
fn parse_day_month_year(text: &str) -> Option<NaiveDate> {
    let parts = text
        .split(['/', '-', '.'])
        .map(str::trim)
        .collect::<Vec<_>>();
    let [d, m, y] = parts.as_slice() else {
        return None;
    };
    let day = d.parse::<u32>().ok()?;
    let month = m.parse::<u32>().ok()?;
    let year = y.parse::<i32>().ok()?;
    NaiveDate::from_ymd_opt(expand_year(year), month, day)
}

fn parse_generic_date(text: &str) -> Option<NaiveDate> {
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y/%m/%d") {
        return Some(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.date_naive());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.date())
}

pub fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim();
    if text.is_empty() || text.eq_ignore_ascii_case(NULL_MARKER) {
        return None;
    }
    if let Ok(serial) = text.parse::<f64>() {
        return serial_to_date(serial);
    }
    parse_day_month_year(text).or_else(|| parse_generic_date(text))
}

/// Keeps digits and `.`; several dots are read as thousands grouping.
pub fn parse_number_text(raw: &str) -> Option<f64> {
    let mut cleaned = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect::<String>();
    if cleaned.matches('.').count() > 1 {
        cleaned.retain(|c| c != '.');
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Free-text condition -> `broken | maintenance | disposed | active`.
pub fn map_status(raw: &str) -> &'static str {
    let text = raw.nfc().collect::<String>().to_lowercase();
    if text.contains("hỏng") || text.contains("broken") {
        "broken"
    } else if text.contains("bảo dưỡng") || text.contains("sửa chữa") || text.contains("maintenance") {
        "maintenance"
    } else if text.contains("thanh lý") || text.contains("disposed") {
        "disposed"
    } else {
        "active"
    }
}

fn present_text(cell: &CellValue) -> Option<String> {
    let text = cell.display_text();
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case(NULL_MARKER) {
        None
    } else {
        Some(text.to_string())
    }
}

fn coerce_number(cell: &CellValue) -> Option<f64> {
    match cell {
        CellValue::Number(n) if n.is_finite() => Some(*n),
        CellValue::Text(s) => parse_number_text(s),
        _ => None,
    }
}

pub fn coerce(cell: &CellValue, kind: FieldKind) -> Option<FieldValue> {
    match kind {
        FieldKind::Date => match cell {
            CellValue::Date(date) => Some(FieldValue::Date(*date)),
            CellValue::Number(serial) => serial_to_date(*serial).map(FieldValue::Date),
            CellValue::Text(text) => parse_date_text(text).map(FieldValue::Date),
            CellValue::Empty | CellValue::Bool(_) => None,
        },
        FieldKind::Quantity => Some(FieldValue::Number(coerce_number(cell).unwrap_or(0.0))),
        FieldKind::Number => coerce_number(cell).map(FieldValue::Number),
        FieldKind::NaturalKey => present_text(cell).map(|t| FieldValue::Text(t.to_uppercase())),
        FieldKind::Status => present_text(cell).map(|t| FieldValue::Text(map_status(&t).to_string())),
        FieldKind::Text => present_text(cell).map(FieldValue::Text),
    }
}

/// Draft for one data row, or `None` when every cell in the row is blank.
pub fn build_draft(
    row_index: usize,
    cells: &[CellValue],
    map: &ColumnMap,
    schema: &EntitySchema,
) -> Option<RecordDraft> {
    if cells.iter().all(CellValue::is_empty) {
        return None;
    }
    let mut draft = RecordDraft::new(schema.entity, row_index);
    for (column, field) in map.iter() {
        let cell = cells.get(column).unwrap_or(&CellValue::Empty);
        if let Some(value) = coerce(cell, schema.field_kind(field)) {
            draft.fields.insert(field.to_string(), value);
        }
    }
    Some(draft)
}
