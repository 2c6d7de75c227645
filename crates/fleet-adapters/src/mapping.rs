use std::sync::OnceLock;

use fleet_core::{CellValue, ColumnMap, RawGrid};
use regex::Regex;
use tracing::{debug, warn};

use crate::schema::EntitySchema;

/// Share of code-like cells below which the key column is considered displaced.
const SHIFT_KEY_CEILING: f64 = 0.5;
/// Share of code-like cells the neighbouring column needs to take over.
const SHIFT_NEIGHBOUR_FLOOR: f64 = 0.8;

fn safe_identifier() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("safe identifier regex should compile"))
}

fn placeholder_column() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(__EMPTY.*|_.*|column_?\d+|s?tt|no|id)$").expect("placeholder regex should compile")
    })
}

fn code_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]{1,24}$").expect("code regex should compile")
    })
}

/// Label kept verbatim when no synonym matches. Row numbers (`STT`) and `id` never pass.
pub fn is_passthrough_label(label: &str) -> bool {
    safe_identifier().is_match(label) && !placeholder_column().is_match(label)
}

pub fn map_columns(raw_labels: &[String], schema: &EntitySchema) -> ColumnMap {
    let mut map = ColumnMap::new();
    for (column, raw) in raw_labels.iter().enumerate() {
        let label = raw.trim();
        let field = match schema.resolve_label(label) {
            Some(field) => field.to_string(),
            None if is_passthrough_label(label) => label.to_string(),
            None => continue,
        };
        if !map.insert(column, field.clone()) {
            debug!(column, %field, "duplicate column for field ignored");
        }
    }
    map
}

/// Code-shaped: no spaces, at least one digit.
pub fn looks_like_code(cell: &CellValue) -> bool {
    let text = cell.display_text();
    code_like().is_match(&text) && text.chars().any(|c| c.is_ascii_digit())
}

fn code_share(grid: &RawGrid, data_rows: std::ops::Range<usize>, column: usize) -> Option<f64> {
    let cells = data_rows
        .map(|row| grid.cell(row, column))
        .filter(|cell| !cell.is_empty())
        .collect::<Vec<_>>();
    if cells.is_empty() {
        return None;
    }
    let codes = cells.iter().filter(|cell| looks_like_code(cell)).count();
    Some(codes as f64 / cells.len() as f64)
}

/// Detects data sitting one column right of its header by checking the
/// natural-key column against its neighbour across every data row.
pub fn detect_column_shift(
    grid: &RawGrid,
    header_row: usize,
    map: &ColumnMap,
    schema: &EntitySchema,
) -> Option<usize> {
    let key_column = map.column_of(&schema.natural_key)?;
    let data_rows = (header_row + 1)..grid.len();
    if data_rows.is_empty() {
        return None;
    }
    let key_share = code_share(grid, data_rows.clone(), key_column).unwrap_or(0.0);
    let neighbour_share = code_share(grid, data_rows, key_column + 1)?;
    if key_share < SHIFT_KEY_CEILING && neighbour_share >= SHIFT_NEIGHBOUR_FLOOR {
        warn!(
            entity = %schema.entity,
            key_column,
            key_share,
            neighbour_share,
            "natural key values sit one column right of the header; shifting columns"
        );
        Some(1)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use fleet_core::EntityType;

    fn labels(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn maps_synonyms_and_passes_safe_identifiers_through() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.schema(EntityType::Machine);
        let map = map_columns(
            &labels(&["STT", "Mã quản lý", "Tên máy móc", "engine_no", "__EMPTY_3", "_x", "Column7", "Số  lượng?"]),
            schema,
        );
        assert_eq!(map.get(1), Some("code"));
        assert_eq!(map.get(2), Some("name"));
        assert_eq!(map.get(3), Some("engine_no"));
        assert_eq!(map.get(0), None);
        assert_eq!(map.get(4), None);
        assert_eq!(map.get(5), None);
        assert_eq!(map.get(6), None);
        assert_eq!(map.get(7), None);
    }

    #[test]
    fn leftmost_duplicate_wins() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.schema(EntityType::Machine);
        let map = map_columns(&labels(&["Mã tài sản", "Biển số"]), schema);
        assert_eq!(map.column_of("code"), Some(0));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn standards_example_header() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.schema(EntityType::MaintenanceStandard);
        let map = map_columns(&labels(&["mã xe", "định mức", "chu kỳ"]), schema);
        assert_eq!(map.get(0), Some("machine_code"));
        assert_eq!(map.get(1), Some("name"));
        assert_eq!(map.get(2), Some("interval_hours"));
    }

    fn shifted_grid() -> RawGrid {
        let row = |cells: &[&str]| cells.iter().map(|c| CellValue::from(*c)).collect::<Vec<_>>();
        RawGrid::new(vec![
            row(&["Mã quản lý", "Tên máy móc", "Dự án"]),
            row(&["Vincons", "4C0001", "Xe tải"]),
            row(&["Vincons", "4C0002", "Máy xúc"]),
            row(&["Vincons", "QN-0003", "Cẩu"]),
        ])
    }

    #[test]
    fn detects_values_one_column_right_of_header() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.schema(EntityType::Machine);
        let grid = shifted_grid();
        let map = map_columns(&labels(&["Mã quản lý", "Tên máy móc", "Dự án"]), schema);
        assert_eq!(detect_column_shift(&grid, 0, &map, schema), Some(1));
        assert_eq!(map.shifted(1).column_of("code"), Some(1));
    }

    #[test]
    fn aligned_sheet_is_not_shifted() {
        let registry = SchemaRegistry::builtin();
        let schema = registry.schema(EntityType::Machine);
        let row = |cells: &[&str]| cells.iter().map(|c| CellValue::from(*c)).collect::<Vec<_>>();
        let grid = RawGrid::new(vec![
            row(&["Mã quản lý", "Tên máy móc"]),
            row(&["4C0001", "Xe tải"]),
            row(&["4C0002", "Máy xúc"]),
        ]);
        let map = map_columns(&labels(&["Mã quản lý", "Tên máy móc"]), schema);
        assert_eq!(detect_column_shift(&grid, 0, &map, schema), None);
    }

    #[test]
    fn code_shapes() {
        assert!(looks_like_code(&CellValue::from("4C0001")));
        assert!(looks_like_code(&CellValue::from("QN-0003")));
        assert!(looks_like_code(&CellValue::Number(1234.0)));
        assert!(!looks_like_code(&CellValue::from("Xe tải")));
        assert!(!looks_like_code(&CellValue::from("Vincons")));
    }
}
