//! Resolves each record's one foreign key against its parent collection.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use fleet_adapters::{EntitySchema, ForeignKey};
use fleet_core::{CanonicalRecord, FieldValue, StoreRow};
use fleet_storage::EntityStore;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::names::NameAlias;

/// Group label meaning "not assigned"; never linked or created.
pub const UNASSIGNED_LABEL: &str = "Unassigned";

const PARENT_ID_COLUMN: &str = "id";
const PARENT_CODE_COLUMN: &str = "code";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkOutcome {
    pub resolved: usize,
    pub unresolved: usize,
    pub created_parents: usize,
}

fn label_key(label: &str) -> String {
    label.trim().to_lowercase()
}

/// `"Vinhomes Ocean Park"` -> `"VIN-OCE-PAR-42"`; the suffix comes from the name's hash.
pub fn project_code(name: &str, attempt: usize) -> String {
    let stem = name
        .split(|c: char| c == '-' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .take(3)
        .map(|part| part.chars().take(3).collect::<String>().to_uppercase())
        .collect::<Vec<_>>()
        .join("-");
    let digest = Sha256::digest(name.trim().to_lowercase().as_bytes());
    let suffix = (usize::from(digest[0]) + attempt) % 100;
    if attempt < 100 {
        format!("{stem}-{suffix:02}")
    } else {
        format!("{stem}-{suffix:02}-{attempt}")
    }
}

fn json_to_link(value: &JsonValue) -> Option<FieldValue> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(FieldValue::Text(s.clone())),
        JsonValue::Number(n) => n.as_f64().map(FieldValue::Number),
        _ => None,
    }
}

struct ParentIndex {
    ids: HashMap<String, FieldValue>,
    codes: BTreeSet<String>,
}

impl ParentIndex {
    fn build(rows: &[StoreRow], parent_label: &str) -> Self {
        let mut ids = HashMap::new();
        let mut codes = BTreeSet::new();
        for row in rows {
            if let Some(code) = row.get(PARENT_CODE_COLUMN).and_then(JsonValue::as_str) {
                codes.insert(code.to_string());
            }
            let label = row.get(parent_label).and_then(JsonValue::as_str);
            let id = row.get(PARENT_ID_COLUMN).and_then(json_to_link);
            if let (Some(label), Some(id)) = (label, id) {
                ids.entry(label_key(label)).or_insert(id);
            }
        }
        Self { ids, codes }
    }
}

async fn load_index(store: &dyn EntityStore, fk: &ForeignKey) -> Option<ParentIndex> {
    match store.select_all(&fk.parent_collection, None).await {
        Ok(rows) => Some(ParentIndex::build(&rows, &fk.parent_label)),
        Err(err) => {
            warn!(collection = %fk.parent_collection, error = %err, "parent lookup failed");
            None
        }
    }
}

fn labelled<'a>(records: &'a [CanonicalRecord], fk: &'a ForeignKey) -> impl Iterator<Item = &'a str> {
    records
        .iter()
        .filter_map(|r| r.text(&fk.label_field))
        .filter(|label| !label.eq_ignore_ascii_case(UNASSIGNED_LABEL))
}

/// Parent rows for labels with no match, keyed by a unique generated code.
fn missing_parents(
    records: &[CanonicalRecord],
    fk: &ForeignKey,
    index: &ParentIndex,
    aliases: &[NameAlias],
) -> Vec<StoreRow> {
    let mut wanted: BTreeMap<String, String> = BTreeMap::new();
    for label in labelled(records, fk) {
        let key = label_key(label);
        if !index.ids.contains_key(&key) {
            wanted.entry(key).or_insert_with(|| label.to_string());
        }
    }

    let mut used_codes = index.codes.clone();
    wanted
        .into_values()
        .map(|name| {
            let mut attempt = 0;
            let mut code = project_code(&name, attempt);
            while used_codes.contains(&code) {
                attempt += 1;
                code = project_code(&name, attempt);
            }
            used_codes.insert(code.clone());

            let mut originals = aliases
                .iter()
                .filter(|a| a.canonical == name)
                .map(|a| a.raw.as_str())
                .collect::<BTreeSet<_>>();
            originals.insert(name.as_str());
            let description = format!(
                "Auto-synced. Original names: {}",
                originals.into_iter().collect::<Vec<_>>().join(", ")
            );
            let mut row = StoreRow::new();
            row.insert(fk.parent_label.clone(), JsonValue::String(name));
            row.insert(PARENT_CODE_COLUMN.to_string(), JsonValue::String(code));
            row.insert("status".to_string(), JsonValue::from("active"));
            row.insert("description".to_string(), JsonValue::String(description));
            row
        })
        .collect()
}

pub async fn link_parents(
    store: &dyn EntityStore,
    fk: &ForeignKey,
    records: &mut [CanonicalRecord],
    aliases: &[NameAlias],
) -> LinkOutcome {
    let mut outcome = LinkOutcome::default();
    let candidates = labelled(records, fk).count();
    if candidates == 0 {
        return outcome;
    }

    let Some(mut index) = load_index(store, fk).await else {
        outcome.unresolved = candidates;
        return outcome;
    };

    if fk.create_missing {
        let parents = missing_parents(records, fk, &index, aliases);
        if !parents.is_empty() {
            match store
                .upsert(&fk.parent_collection, &parents, &[PARENT_CODE_COLUMN])
                .await
            {
                Ok(written) => {
                    outcome.created_parents = written.inserted;
                    info!(
                        collection = %fk.parent_collection,
                        created = written.inserted,
                        "created missing parent rows"
                    );
                    if let Some(reloaded) = load_index(store, fk).await {
                        index = reloaded;
                    }
                }
                Err(err) => warn!(collection = %fk.parent_collection, error = %err, "creating parents failed"),
            }
        }
    }

    for record in records.iter_mut() {
        let Some(key) = record.text(&fk.label_field).map(label_key) else {
            continue;
        };
        if key.eq_ignore_ascii_case(UNASSIGNED_LABEL) {
            continue;
        }
        match index.ids.get(&key) {
            Some(id) => {
                record.set_link(&fk.link_field, id.clone());
                outcome.resolved += 1;
            }
            None => {
                debug!(label = %key, "no parent row for label");
                outcome.unresolved += 1;
            }
        }
    }
    outcome
}

/// Removes records whose link did not resolve when the label column is not
/// written alongside the link. Returns how many were removed.
pub fn drop_unlinked(records: &mut Vec<CanonicalRecord>, fk: &ForeignKey) -> usize {
    if !fk.replace_label || fk.create_missing {
        return 0;
    }
    let before = records.len();
    records.retain(|r| r.get(&fk.link_field).is_some());
    before - records.len()
}

/// Keeps only records whose conflict key already has a row in the target
/// collection. Returns how many were removed, or every record when the
/// lookup fails.
pub async fn retain_existing(
    store: &dyn EntityStore,
    schema: &EntitySchema,
    records: &mut Vec<CanonicalRecord>,
) -> usize {
    let Some(keys) = schema.conflict_columns() else {
        return 0;
    };
    let collection = schema.entity.collection();
    let existing = match store.select_all(collection, None).await {
        Ok(rows) => rows
            .iter()
            .filter_map(|row| {
                keys.iter()
                    .map(|k| row.get(*k).and_then(json_to_link).map(|v| v.to_string()))
                    .collect::<Option<Vec<_>>>()
            })
            .collect::<HashSet<_>>(),
        Err(err) => {
            warn!(collection, error = %err, "existing row lookup failed");
            let dropped = records.len();
            records.clear();
            return dropped;
        }
    };

    let before = records.len();
    records.retain(|record| {
        keys.iter()
            .map(|k| record.get(k).map(|v| v.to_string()))
            .collect::<Option<Vec<_>>>()
            .is_some_and(|key| existing.contains(&key))
    });
    let dropped = before - records.len();
    if dropped > 0 {
        info!(collection, dropped, "skipped rows with no existing target row");
    }
    dropped
}
