//! Batched writes with a one-shot fallback to the legacy row layout.

use std::collections::HashMap;

use fleet_adapters::EntitySchema;
use fleet_core::{CanonicalRecord, EntityType, MergeMode, StoreRow};
use fleet_storage::{EntityStore, StoreError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const MIN_BATCH_SIZE: usize = 100;
pub const MAX_BATCH_SIZE: usize = 1000;

/// Store layouts, tried in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowShape {
    Current,
    Legacy,
}

impl RowShape {
    pub fn encode(self, record: &CanonicalRecord, schema: &EntitySchema) -> StoreRow {
        let mut row = record.to_row();
        match self {
            Self::Current => {
                if let Some(fk) = schema.foreign_key.as_ref().filter(|fk| fk.replace_label) {
                    if row.contains_key(&fk.link_field) {
                        row.remove(&fk.label_field);
                    }
                }
            }
            Self::Legacy => {
                if let Some(legacy) = &schema.legacy_shape {
                    for (from, to) in &legacy.renames {
                        if let Some(value) = row.remove(from) {
                            row.insert(to.clone(), value);
                        }
                    }
                    row.retain(|column, _| legacy.columns.contains(column));
                }
            }
        }
        row
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub entity: EntityType,
    pub collection: String,
    pub batch_index: usize,
    pub rows: usize,
    pub error: StoreError,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Rows in batches that could not be written.
    pub failed: usize,
    pub batches: usize,
    /// Batches that only went through in the legacy layout.
    pub recovered_batches: usize,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Copy)]
pub struct MergeEngine {
    batch_size: usize,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

/// Keeps one record per conflict key: the last row's values at the first row's position.
/// Records missing any key column are kept as they are.
pub fn collapse_by_key(records: Vec<CanonicalRecord>, conflict_key: &[&str]) -> Vec<CanonicalRecord> {
    let mut slots: Vec<CanonicalRecord> = Vec::with_capacity(records.len());
    let mut positions: HashMap<Vec<String>, usize> = HashMap::new();
    for record in records {
        let key = conflict_key
            .iter()
            .map(|column| record.get(column).map(|v| v.to_string()))
            .collect::<Option<Vec<_>>>();
        match key {
            Some(key) => match positions.get(&key) {
                Some(&at) => slots[at] = record,
                None => {
                    positions.insert(key, slots.len());
                    slots.push(record);
                }
            },
            None => slots.push(record),
        }
    }
    slots
}

impl MergeEngine {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn write(
        &self,
        store: &dyn EntityStore,
        schema: &EntitySchema,
        rows: &[StoreRow],
    ) -> Result<fleet_storage::WriteOutcome, StoreError> {
        let collection = schema.entity.collection();
        match (schema.entity.merge_mode(), schema.conflict_columns()) {
            (MergeMode::Upsert, Some(key)) => store.upsert(collection, rows, &key).await,
            _ => store.insert(collection, rows).await,
        }
    }

    pub async fn merge(
        &self,
        store: &dyn EntityStore,
        schema: &EntitySchema,
        records: Vec<CanonicalRecord>,
    ) -> MergeOutcome {
        let records = match (schema.entity.merge_mode(), schema.conflict_columns()) {
            (MergeMode::Upsert, Some(key)) => collapse_by_key(records, &key),
            _ => records,
        };
        let mut outcome = MergeOutcome::default();
        let collection = schema.entity.collection();

        for (batch_index, batch) in records.chunks(self.batch_size).enumerate() {
            outcome.batches += 1;
            let rows = batch
                .iter()
                .map(|r| RowShape::Current.encode(r, schema))
                .collect::<Vec<_>>();
            let first = self.write(store, schema, &rows).await;

            let result = match first {
                Err(err) if err.is_undefined_column() && schema.legacy_shape.is_some() => {
                    debug!(collection, batch_index, error = %err, "retrying batch in legacy layout");
                    let legacy = batch
                        .iter()
                        .map(|r| RowShape::Legacy.encode(r, schema))
                        .collect::<Vec<_>>();
                    let retried = self.write(store, schema, &legacy).await;
                    if retried.is_ok() {
                        outcome.recovered_batches += 1;
                        info!(collection, batch_index, "batch recovered with legacy layout");
                    }
                    retried
                }
                other => other,
            };

            match result {
                Ok(written) => {
                    outcome.inserted += written.inserted;
                    outcome.updated += written.updated;
                }
                Err(error) => {
                    warn!(collection, batch_index, rows = batch.len(), error = %error, "batch write failed");
                    outcome.failed += batch.len();
                    outcome.failures.push(BatchFailure {
                        entity: schema.entity,
                        collection: collection.to_string(),
                        batch_index,
                        rows: batch.len(),
                        error,
                    });
                }
            }
        }
        outcome
    }
}

/// Non-null JSON value of a row column as display text.
pub fn column_text(row: &StoreRow, column: &str) -> Option<String> {
    match row.get(column)? {
        JsonValue::Null => None,
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
