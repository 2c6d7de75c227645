//! Entity store contract plus in-memory and Postgres implementations.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::StoreRow;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fleet-storage";

/// Column every store row carries; generated on insert when absent.
pub const ID_COLUMN: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorKind {
    /// The row shape names a column the collection does not have.
    UndefinedColumn,
    Constraint,
    Unavailable,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn undefined_column(collection: &str, column: &str) -> Self {
        Self::new(
            StoreErrorKind::UndefinedColumn,
            format!("column \"{column}\" of relation \"{collection}\" does not exist"),
        )
    }

    pub fn is_undefined_column(&self) -> bool {
        self.kind == StoreErrorKind::UndefinedColumn
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub inserted: usize,
    pub updated: usize,
}

/// Equality filter for `select_all`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFilter {
    pub column: String,
    pub equals: JsonValue,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, equals: impl Into<JsonValue>) -> Self {
        Self {
            column: column.into(),
            equals: equals.into(),
        }
    }

    fn matches(&self, row: &StoreRow) -> bool {
        row.get(&self.column) == Some(&self.equals)
    }
}

/// Abstract target store. A failed call leaves the collection unchanged.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Inserts or updates rows matched on every column of `conflict_key`.
    async fn upsert(
        &self,
        collection: &str,
        rows: &[StoreRow],
        conflict_key: &[&str],
    ) -> Result<WriteOutcome, StoreError>;

    async fn insert(&self, collection: &str, rows: &[StoreRow]) -> Result<WriteOutcome, StoreError>;

    async fn select_all(
        &self,
        collection: &str,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<StoreRow>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryCollection {
    columns: Option<BTreeSet<String>>,
    rows: Vec<StoreRow>,
}

impl MemoryCollection {
    fn check_columns(&self, collection: &str, rows: &[StoreRow]) -> Result<(), StoreError> {
        let Some(columns) = &self.columns else {
            return Ok(());
        };
        for row in rows {
            if let Some(unknown) = row
                .keys()
                .find(|k| k.as_str() != ID_COLUMN && !columns.contains(k.as_str()))
            {
                return Err(StoreError::undefined_column(collection, unknown));
            }
        }
        Ok(())
    }

    fn push_new(&mut self, row: &StoreRow) {
        let mut row = row.clone();
        row.entry(ID_COLUMN.to_string())
            .or_insert_with(|| JsonValue::String(Uuid::new_v4().to_string()));
        self.rows.push(row);
    }
}

/// Process-local store used for dry runs and tests.
///
/// Collections spring into existence on first write and accept any column
/// unless [`MemoryStore::define_collection`] declared a fixed column set.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, MemoryCollection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixes the column set; later writes naming other columns fail with `UndefinedColumn`.
    pub async fn define_collection(&self, collection: &str, columns: &[&str]) {
        let mut map = self.collections.lock().await;
        let entry = map.entry(collection.to_string()).or_default();
        entry.columns = Some(columns.iter().map(|c| c.to_string()).collect());
    }

    pub async fn rows(&self, collection: &str) -> Vec<StoreRow> {
        let map = self.collections.lock().await;
        map.get(collection).map(|c| c.rows.clone()).unwrap_or_default()
    }

    pub async fn count(&self, collection: &str) -> usize {
        let map = self.collections.lock().await;
        map.get(collection).map(|c| c.rows.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn upsert(
        &self,
        collection: &str,
        rows: &[StoreRow],
        conflict_key: &[&str],
    ) -> Result<WriteOutcome, StoreError> {
        let mut map = self.collections.lock().await;
        let target = map.entry(collection.to_string()).or_default();
        target.check_columns(collection, rows)?;
        for key in conflict_key {
            if let Some(columns) = &target.columns {
                if !columns.contains(*key) {
                    return Err(StoreError::undefined_column(collection, key));
                }
            }
            if let Some(row) = rows.iter().find(|r| r.get(*key).map_or(true, JsonValue::is_null)) {
                return Err(StoreError::new(
                    StoreErrorKind::Constraint,
                    format!("null value in column \"{key}\" of relation \"{collection}\""),
                )
                .with_detail(format!("{}", JsonValue::Object(row.clone()))));
            }
        }

        let mut outcome = WriteOutcome::default();
        for row in rows {
            match target
                .rows
                .iter_mut()
                .find(|existing| conflict_key.iter().all(|k| existing.get(*k) == row.get(*k)))
            {
                Some(existing) => {
                    for (column, value) in row {
                        existing.insert(column.clone(), value.clone());
                    }
                    outcome.updated += 1;
                }
                None => {
                    target.push_new(row);
                    outcome.inserted += 1;
                }
            }
        }
        Ok(outcome)
    }

    async fn insert(&self, collection: &str, rows: &[StoreRow]) -> Result<WriteOutcome, StoreError> {
        let mut map = self.collections.lock().await;
        let target = map.entry(collection.to_string()).or_default();
        target.check_columns(collection, rows)?;
        for row in rows {
            target.push_new(row);
        }
        Ok(WriteOutcome {
            inserted: rows.len(),
            updated: 0,
        })
    }

    async fn select_all(
        &self,
        collection: &str,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<StoreRow>, StoreError> {
        let map = self.collections.lock().await;
        Ok(map
            .get(collection)
            .map(|c| {
                c.rows
                    .iter()
                    .filter(|row| filter.map_or(true, |f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(20),
        }
    }
}

/// Postgres-backed store. Rows travel as one `jsonb` array per statement and
/// are expanded with `jsonb_populate_recordset`, so column types come from the
/// table definition.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, config: PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write(
        &self,
        collection: &str,
        rows: &[StoreRow],
        conflict_key: Option<&[&str]>,
    ) -> Result<WriteOutcome, StoreError> {
        let span = info_span!("pg_write", collection, rows = rows.len());
        async {
            let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
            let mut outcome = WriteOutcome::default();
            // One statement per column set so absent fields never overwrite stored values with NULL.
            for (columns, group) in group_by_columns(rows) {
                let sql = write_statement(collection, &columns, conflict_key);
                let payload = Json(JsonValue::Array(
                    group.into_iter().map(|r| JsonValue::Object(r.clone())).collect(),
                ));
                debug!(%sql, "executing batch statement");
                let flags: Vec<bool> = sqlx::query_scalar(&sql)
                    .bind(payload)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;
                let inserted = flags.iter().filter(|f| **f).count();
                outcome.inserted += inserted;
                outcome.updated += flags.len() - inserted;
            }
            tx.commit().await.map_err(map_sqlx_error)?;
            Ok::<_, StoreError>(outcome)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn upsert(
        &self,
        collection: &str,
        rows: &[StoreRow],
        conflict_key: &[&str],
    ) -> Result<WriteOutcome, StoreError> {
        self.write(collection, rows, Some(conflict_key)).await
    }

    async fn insert(&self, collection: &str, rows: &[StoreRow]) -> Result<WriteOutcome, StoreError> {
        self.write(collection, rows, None).await
    }

    async fn select_all(
        &self,
        collection: &str,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<StoreRow>, StoreError> {
        let table = quote_ident(collection);
        let rows = match filter {
            Some(filter) => {
                let sql = format!("SELECT to_jsonb(t) AS row FROM {table} t WHERE to_jsonb(t) -> $1 = $2");
                sqlx::query(&sql)
                    .bind(&filter.column)
                    .bind(Json(filter.equals.clone()))
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                let sql = format!("SELECT to_jsonb(t) AS row FROM {table} t");
                sqlx::query(&sql).fetch_all(&self.pool).await
            }
        }
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                let Json(value): Json<JsonValue> = row.try_get("row").map_err(map_sqlx_error)?;
                match value {
                    JsonValue::Object(map) => Ok(map),
                    other => Err(StoreError::new(
                        StoreErrorKind::Other,
                        format!("expected a JSON object row from {collection}, got {other}"),
                    )),
                }
            })
            .collect()
    }
}

fn group_by_columns(rows: &[StoreRow]) -> Vec<(Vec<String>, Vec<&StoreRow>)> {
    let mut groups: Vec<(Vec<String>, Vec<&StoreRow>)> = Vec::new();
    for row in rows {
        let columns = row.keys().cloned().collect::<Vec<_>>();
        match groups.iter_mut().find(|(c, _)| *c == columns) {
            Some((_, members)) => members.push(row),
            None => groups.push((columns, vec![row])),
        }
    }
    groups
}

fn write_statement(collection: &str, columns: &[String], conflict_key: Option<&[&str]>) -> String {
    let table = quote_ident(collection);
    let column_list = columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let mut sql = format!(
        "INSERT INTO {table} ({column_list}) SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table}, $1)"
    );
    if let Some(keys) = conflict_key {
        let target = keys.iter().map(|k| quote_ident(k)).collect::<Vec<_>>().join(", ");
        let updates = columns
            .iter()
            .filter(|c| !keys.contains(&c.as_str()))
            .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
            .collect::<Vec<_>>();
        if updates.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({target}) DO NOTHING"));
        } else {
            sql.push_str(&format!(" ON CONFLICT ({target}) DO UPDATE SET {}", updates.join(", ")));
        }
    }
    sql.push_str(" RETURNING (xmax = 0) AS inserted");
    sql
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Maps a Postgres SQLSTATE onto the store's error kinds.
pub fn classify_sqlstate(code: &str) -> StoreErrorKind {
    match code {
        "42703" => StoreErrorKind::UndefinedColumn,
        c if c.starts_with("23") => StoreErrorKind::Constraint,
        c if c.starts_with("08") || c.starts_with("57") => StoreErrorKind::Unavailable,
        _ => StoreErrorKind::Other,
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let kind = db
                .code()
                .map(|code| classify_sqlstate(&code))
                .unwrap_or(StoreErrorKind::Other);
            let error = StoreError::new(kind, db.message().to_string());
            match db.constraint() {
                Some(constraint) => error.with_detail(format!("constraint {constraint}")),
                None => error,
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::new(StoreErrorKind::Unavailable, err.to_string())
        }
        _ => StoreError::new(StoreErrorKind::Other, err.to_string()),
    }
}
