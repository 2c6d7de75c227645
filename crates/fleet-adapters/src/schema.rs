//! Per-entity synonym tables, signatures and merge rules.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use fleet_core::{fold_label, EntityType};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HEADER_WINDOW: usize = 20;
pub const DEEP_HEADER_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    /// Business identifier; trimmed and upper-cased.
    NaturalKey,
    Date,
    /// Counter-like number; unparseable input becomes 0.
    Quantity,
    /// Plain number; unparseable input is absent.
    Number,
    Status,
}

/// One foreign-key match an entity may carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKey {
    pub label_field: String,
    pub parent_collection: String,
    pub parent_label: String,
    pub link_field: String,
    pub create_missing: bool,
    /// Drop `label_field` from the written row once the link resolves.
    pub replace_label: bool,
}

/// Older store layout some deployments still run: renames applied first,
/// then the row is cut down to exactly `columns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegacyShape {
    pub renames: Vec<(String, String)>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySchema {
    pub entity: EntityType,
    /// Ordered `(folded label, canonical field)` pairs.
    pub synonyms: Vec<(String, String)>,
    /// Folded signature keywords used by the classifier.
    pub signature: Vec<String>,
    pub required: Vec<String>,
    pub field_kinds: BTreeMap<String, FieldKind>,
    /// Columns an upsert matches on; `None` for insert-only entities.
    pub conflict_key: Option<Vec<String>>,
    pub natural_key: String,
    pub header_window: usize,
    pub foreign_key: Option<ForeignKey>,
    pub group_label_fields: Vec<String>,
    pub legacy_shape: Option<LegacyShape>,
    /// Write only rows whose conflict key already exists in the collection.
    pub update_existing_only: bool,
}

impl EntitySchema {
    fn new(entity: EntityType, natural_key: &str) -> Self {
        Self {
            entity,
            synonyms: Vec::new(),
            signature: Vec::new(),
            required: Vec::new(),
            field_kinds: BTreeMap::new(),
            conflict_key: entity.is_master_data().then(|| vec![natural_key.to_string()]),
            natural_key: natural_key.to_string(),
            header_window: DEFAULT_HEADER_WINDOW,
            foreign_key: None,
            group_label_fields: Vec::new(),
            legacy_shape: None,
            update_existing_only: false,
        }
    }

    pub fn conflict_columns(&self) -> Option<Vec<&str>> {
        self.conflict_key
            .as_ref()
            .map(|keys| keys.iter().map(String::as_str).collect())
    }

    fn field(mut self, field: &str, kind: FieldKind, labels: &[&str]) -> Self {
        self.field_kinds.insert(field.to_string(), kind);
        for label in labels {
            self.push_synonym(label, field);
        }
        self
    }

    fn signature(mut self, keywords: &[&str]) -> Self {
        self.signature.extend(keywords.iter().map(|k| fold_label(k)));
        self
    }

    fn required(mut self, fields: &[&str]) -> Self {
        self.required = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    fn push_synonym(&mut self, label: &str, field: &str) {
        let key = fold_label(label);
        if !key.is_empty() && !self.synonyms.iter().any(|(k, _)| *k == key) {
            self.synonyms.push((key, field.to_string()));
        }
    }

    /// Canonical field for a header label; first matching pair wins.
    pub fn resolve_label(&self, raw_label: &str) -> Option<&str> {
        let key = fold_label(raw_label);
        if key.is_empty() {
            return None;
        }
        self.synonyms
            .iter()
            .find(|(pattern, _)| *pattern == key)
            .map(|(_, field)| field.as_str())
    }

    pub fn field_kind(&self, field: &str) -> FieldKind {
        self.field_kinds.get(field).copied().unwrap_or(FieldKind::Text)
    }

    pub fn is_group_label(&self, field: &str) -> bool {
        self.group_label_fields.iter().any(|f| f == field)
    }
}

fn project_link() -> ForeignKey {
    ForeignKey {
        label_field: "project_name".to_string(),
        parent_collection: "projects".to_string(),
        parent_label: "name".to_string(),
        link_field: "project_id".to_string(),
        create_missing: true,
        replace_label: false,
    }
}

fn machine_schema() -> EntitySchema {
    let mut schema = EntitySchema::new(EntityType::Machine, "code")
        .field(
            "code",
            FieldKind::NaturalKey,
            &["mã quản lý", "mã tài sản", "mã ts", "mã thiết bị", "mã xe", "biển số", "biển số/mã tài sản", "code"],
        )
        .field(
            "name",
            FieldKind::Text,
            &["tên máy móc", "tên tài sản", "tên thiết bị", "tên máy", "tên", "name"],
        )
        .field("model", FieldKind::Text, &["model", "loại máy", "model/loại"])
        .field("group", FieldKind::Text, &["nhóm tb", "nhóm thiết bị", "nhóm", "group"])
        .field(
            "project_name",
            FieldKind::Text,
            &["dự án", "công trình", "dự án/công trình", "project", "project_name"],
        )
        .field("department", FieldKind::Text, &["bộ phận", "bộ phận sử dụng", "department"])
        .field("status", FieldKind::Status, &["tình trạng", "trạng thái", "status"])
        .field(
            "current_hours",
            FieldKind::Quantity,
            &["odo giờ", "odo giờ hiện tại", "giờ máy", "số giờ", "current_hours"],
        )
        .field("current_km", FieldKind::Quantity, &["odo km", "km", "số km", "current_km"])
        .field("serial_number", FieldKind::Text, &["số serial", "số khung", "serial", "serial_number"])
        .field("manufacture_year", FieldKind::Number, &["năm sản xuất", "năm sx", "manufacture_year"])
        .field("description", FieldKind::Text, &["mô tả", "description"])
        .field("notes", FieldKind::Text, &["ghi chú", "notes"])
        .signature(&[
            "tên máy",
            "tên tài sản",
            "model",
            "nhóm tb",
            "odo",
            "tình trạng",
            "mã quản lý",
            "biển số",
        ])
        .required(&["code"]);
    schema.foreign_key = Some(project_link());
    schema.group_label_fields = vec!["project_name".to_string()];
    schema
}

fn maintenance_standard_schema() -> EntitySchema {
    let mut schema = EntitySchema::new(EntityType::MaintenanceStandard, "machine_code")
        .field(
            "machine_code",
            FieldKind::NaturalKey,
            &["mã xe", "mã tài sản", "mã quản lý", "mã máy", "machine_code"],
        )
        .field(
            "name",
            FieldKind::Text,
            &["định mức", "tên định mức", "mức bd", "định mức bảo dưỡng", "name"],
        )
        .field(
            "interval_hours",
            FieldKind::Number,
            &["chu kỳ", "kỳ hạn", "chu kỳ bd", "giờ", "interval_hours", "hours_interval"],
        )
        .field("description", FieldKind::Text, &["mô tả", "nội dung", "description"])
        .field("notes", FieldKind::Text, &["ghi chú", "notes"])
        .signature(&["định mức", "kỳ hạn", "chu kỳ", "mức bd"])
        .required(&["machine_code", "name"]);
    // A machine carries several standards, one per interval name.
    schema.conflict_key = Some(vec!["machine_code".to_string(), "name".to_string()]);
    schema
}

fn maintenance_history_schema() -> EntitySchema {
    let mut schema = EntitySchema::new(EntityType::MaintenanceHistory, "machine_code")
        .field(
            "machine_code",
            FieldKind::NaturalKey,
            &["mã tài sản", "mã xe", "mã quản lý", "machine_code", "code"],
        )
        .field(
            "date",
            FieldKind::Date,
            &["ngày thực hiện", "ngày bd", "ngày bảo dưỡng", "ngày", "ngày tháng", "date"],
        )
        .field(
            "task_name",
            FieldKind::Text,
            &["nội dung", "nội dung bd", "nội dung công việc", "công việc", "task_name"],
        )
        .field(
            "maintenance_level",
            FieldKind::Text,
            &["mức bd", "loại bd", "cấp bảo dưỡng", "level", "maintenance_level"],
        )
        .field(
            "hours_at_maintenance",
            FieldKind::Quantity,
            &["odo giờ thực hiện bd", "odo bd", "odo bảo dưỡng", "giờ bd", "hours", "hours_at_maintenance"],
        )
        .field("cost", FieldKind::Quantity, &["chi phí", "cost"])
        .field("performer", FieldKind::Text, &["thợ sửa chữa", "người thực hiện", "performer"])
        .field("repair_plan", FieldKind::Text, &["phương án sửa chữa", "repair_plan"])
        .field("notes", FieldKind::Text, &["ghi chú", "notes"])
        .signature(&[
            "ngày bảo dưỡng",
            "nội dung",
            "odo bảo dưỡng",
            "thợ sửa chữa",
            "phương án sửa chữa",
            "ngày thực hiện",
            "công việc",
        ])
        .required(&["machine_code"]);
    schema.header_window = DEEP_HEADER_WINDOW;
    schema
}

fn project_mapping_schema() -> EntitySchema {
    let mut schema = EntitySchema::new(EntityType::ProjectMapping, "code")
        .field(
            "code",
            FieldKind::NaturalKey,
            &["mã tài sản", "mã quản lý", "mã xe", "mã ts", "code"],
        )
        .field(
            "project_name",
            FieldKind::Text,
            &["dự án", "công trình", "dự án/công trình", "project_name"],
        )
        .field("department", FieldKind::Text, &["bộ phận", "bộ phận sử dụng", "department"])
        .signature(&["mã tài sản", "dự án", "bộ phận", "công trình"])
        .required(&["code", "project_name"]);
    schema.foreign_key = Some(project_link());
    schema.group_label_fields = vec!["project_name".to_string()];
    schema.update_existing_only = true;
    schema
}

fn parts_schema() -> EntitySchema {
    EntitySchema::new(EntityType::Parts, "part_number")
        .field(
            "part_number",
            FieldKind::NaturalKey,
            &["mã danh điểm", "mã vật tư", "mã phụ tùng", "part number", "part_number"],
        )
        .field("name", FieldKind::Text, &["tên vật tư", "tên phụ tùng", "name"])
        .field("donaldson_code", FieldKind::Text, &["mã donaldson", "donaldson_code"])
        .field("quantity", FieldKind::Number, &["số lượng", "quantity"])
        .field("unit", FieldKind::Text, &["đvt", "đơn vị tính", "unit"])
        .field("group", FieldKind::Text, &["nhóm", "group"])
        .field("equivalents", FieldKind::Text, &["mã tương đương", "equivalents"])
        .field("notes", FieldKind::Text, &["ghi chú", "notes"])
        .signature(&["tên vật tư", "mã danh điểm", "mã donaldson", "số lượng", "đvt", "part number"])
        .required(&["part_number"])
}

fn error_codes_schema() -> EntitySchema {
    EntitySchema::new(EntityType::ErrorCodes, "code")
        .field("code", FieldKind::NaturalKey, &["mã lỗi", "error code", "code"])
        .field("description", FieldKind::Text, &["mô tả lỗi", "mô tả", "description"])
        .field(
            "fix_steps",
            FieldKind::Text,
            &["cách khắc phục", "biện pháp", "biện pháp khắc phục", "fix_steps"],
        )
        .field("severity", FieldKind::Text, &["mức độ", "severity"])
        .signature(&["mã lỗi", "mô tả lỗi", "cách khắc phục", "biện pháp"])
        .required(&["code"])
}

fn daily_log_schema() -> EntitySchema {
    let mut schema = EntitySchema::new(EntityType::DailyLog, "machine_code")
        .field(
            "machine_code",
            FieldKind::NaturalKey,
            &["mã xe", "mã tài sản", "mã quản lý", "biển số", "machine_code"],
        )
        .field("date", FieldKind::Date, &["ngày", "ngày tháng", "ngày hoạt động", "date"])
        .field(
            "hours_added",
            FieldKind::Quantity,
            &["giờ hoạt động", "hoạt động", "số giờ chạy", "hours_added"],
        )
        .field("odo_km", FieldKind::Quantity, &["odo km", "km", "số km", "odo_km"])
        .field(
            "fuel_consumed",
            FieldKind::Quantity,
            &["nhiên liệu", "dầu tiêu thụ", "nhiên liệu tiêu thụ", "fuel_consumed"],
        )
        .field("driver", FieldKind::Text, &["lái xe", "người vận hành", "driver"])
        .field("notes", FieldKind::Text, &["ghi chú", "nội dung", "nhật trình", "notes"])
        .signature(&["giờ hoạt động", "hoạt động", "nhiên liệu", "nhật trình", "số giờ chạy"])
        .required(&["machine_code", "date"]);
    schema.foreign_key = Some(ForeignKey {
        label_field: "machine_code".to_string(),
        parent_collection: "machines".to_string(),
        parent_label: "code".to_string(),
        link_field: "machine_id".to_string(),
        create_missing: false,
        replace_label: true,
    });
    schema.legacy_shape = Some(LegacyShape {
        renames: vec![("notes".to_string(), "note".to_string())],
        columns: ["machine_code", "date", "hours_added", "note"]
            .map(String::from)
            .to_vec(),
    });
    schema
}

/// Immutable per-entity configuration, loaded once per process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaRegistry {
    schemas: Vec<EntitySchema>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryOverrides {
    #[serde(default)]
    pub entities: BTreeMap<EntityType, EntityOverride>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntityOverride {
    #[serde(default)]
    pub synonyms: Vec<SynonymRule>,
    #[serde(default)]
    pub signature: Vec<String>,
    pub header_window: Option<usize>,
    pub conflict_key: Option<KeyColumns>,
}

/// One column name or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KeyColumns {
    One(String),
    Many(Vec<String>),
}

impl KeyColumns {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(column) => vec![column],
            Self::Many(columns) => columns,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SynonymRule {
    pub label: String,
    pub field: String,
}

impl SchemaRegistry {
    pub fn builtin() -> Self {
        Self {
            schemas: vec![
                machine_schema(),
                maintenance_standard_schema(),
                maintenance_history_schema(),
                project_mapping_schema(),
                parts_schema(),
                error_codes_schema(),
                daily_log_schema(),
            ],
        }
    }

    /// Builtin tables plus any rules from a YAML file.
    pub fn with_overrides_from_yaml(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let overrides: RegistryOverrides =
            serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let mut registry = Self::builtin();
        registry.apply(overrides);
        Ok(registry)
    }

    /// Loads `rules/entities.yaml` under `workspace_root` when it exists.
    pub fn from_workspace_root(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("rules").join("entities.yaml");
        if path.exists() {
            Self::with_overrides_from_yaml(&path)
        } else {
            Ok(Self::builtin())
        }
    }

    pub fn apply(&mut self, overrides: RegistryOverrides) {
        for (entity, rules) in overrides.entities {
            let Some(schema) = self.schemas.iter_mut().find(|s| s.entity == entity) else {
                continue;
            };
            for rule in &rules.synonyms {
                schema.push_synonym(&rule.label, &rule.field);
            }
            schema
                .signature
                .extend(rules.signature.iter().map(|k| fold_label(k)));
            if let Some(window) = rules.header_window {
                schema.header_window = window.max(1);
            }
            if let Some(key) = rules.conflict_key {
                let columns = key.into_vec();
                if entity.is_master_data() && !columns.is_empty() {
                    schema.conflict_key = Some(columns);
                }
            }
        }
    }

    pub fn schema(&self, entity: EntityType) -> &EntitySchema {
        // Every EntityType has a schema; the registry is built from all of them.
        self.schemas
            .iter()
            .find(|s| s.entity == entity)
            .unwrap_or(&self.schemas[0])
    }

    pub fn schemas(&self) -> &[EntitySchema] {
        &self.schemas
    }

    /// Scan window for a hint, or the widest window when no hint is given.
    pub fn header_window(&self, hint: Option<EntityType>) -> usize {
        match hint {
            Some(entity) => self.schema(entity).header_window,
            None => self
                .schemas
                .iter()
                .map(|s| s.header_window)
                .max()
                .unwrap_or(DEFAULT_HEADER_WINDOW),
        }
    }

    /// True when a folded label is a synonym key for the hint (or any entity).
    pub fn is_known_label(&self, folded: &str, hint: Option<EntityType>) -> bool {
        let matches = |schema: &EntitySchema| schema.synonyms.iter().any(|(k, _)| k == folded);
        match hint {
            Some(entity) => matches(self.schema(entity)),
            None => self.schemas.iter().any(matches),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_entity_has_a_schema_with_required_fields() {
        let registry = SchemaRegistry::builtin();
        for entity in EntityType::ALL {
            let schema = registry.schema(entity);
            assert_eq!(schema.entity, entity);
            assert!(!schema.required.is_empty());
            assert!(schema.signature.len() >= 2);
            for field in &schema.required {
                assert!(schema.field_kinds.contains_key(field), "{entity}: {field}");
            }
        }
    }

    #[test]
    fn machine_labels_resolve_regardless_of_diacritics_and_case() {
        let registry = SchemaRegistry::builtin();
        let machine = registry.schema(EntityType::Machine);
        assert_eq!(machine.resolve_label("Mã quản lý"), Some("code"));
        assert_eq!(machine.resolve_label("TÊN MÁY MÓC"), Some("name"));
        assert_eq!(machine.resolve_label(" Du an "), Some("project_name"));
        assert_eq!(machine.resolve_label("ODO Giờ"), Some("current_hours"));
        assert_eq!(machine.resolve_label("ODO Km"), Some("current_km"));
        assert_eq!(machine.resolve_label("Tình trạng"), Some("status"));
        assert_eq!(machine.resolve_label("Ghi chú khác"), None);
    }

    #[test]
    fn conflict_keys_only_for_master_data() {
        let registry = SchemaRegistry::builtin();
        assert_eq!(
            registry.schema(EntityType::Parts).conflict_columns(),
            Some(vec!["part_number"])
        );
        assert_eq!(
            registry.schema(EntityType::MaintenanceStandard).conflict_columns(),
            Some(vec!["machine_code", "name"])
        );
        assert!(registry.schema(EntityType::ProjectMapping).update_existing_only);
        assert_eq!(registry.schema(EntityType::DailyLog).conflict_key, None);
        assert_eq!(registry.schema(EntityType::MaintenanceHistory).header_window, 50);
        assert_eq!(registry.header_window(Some(EntityType::Machine)), 20);
        assert_eq!(registry.header_window(None), 50);
    }

    #[test]
    fn yaml_overrides_append_synonyms_and_replace_scalars() {
        let dir = tempfile::tempdir().unwrap();
        let rules_dir = dir.path().join("rules");
        std::fs::create_dir_all(&rules_dir).unwrap();
        std::fs::write(
            rules_dir.join("entities.yaml"),
            r#"
entities:
  machine:
    synonyms:
      - { label: "Số hiệu", field: code }
    signature: ["số hiệu"]
    header_window: 30
  daily_log:
    conflict_key: machine_code
  parts:
    conflict_key: [part_number, unit]
"#,
        )
        .unwrap();

        let registry = SchemaRegistry::from_workspace_root(dir.path()).unwrap();
        let machine = registry.schema(EntityType::Machine);
        assert_eq!(machine.resolve_label("Số Hiệu"), Some("code"));
        assert!(machine.signature.contains(&"so hieu".to_string()));
        assert_eq!(machine.header_window, 30);
        assert_eq!(registry.schema(EntityType::DailyLog).conflict_key, None);
        assert_eq!(
            registry.schema(EntityType::Parts).conflict_columns(),
            Some(vec!["part_number", "unit"])
        );
    }

    #[test]
    fn missing_rules_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SchemaRegistry::from_workspace_root(dir.path()).unwrap();
        assert_eq!(registry, SchemaRegistry::builtin());
    }
}
