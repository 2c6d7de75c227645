//! Workbook sync orchestration: validate, normalize, link, merge, verify, report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fleet_adapters::{
    build_draft, plan_sheet, read_workbook, EntityMode, SchemaRegistry, SheetPlan, Workbook,
};
use fleet_core::{ColumnMap, EntityType, IngestError, Rejection, Sheet};
use fleet_storage::{EntityStore, MemoryStore, PgStore, PgStoreConfig};
use serde::Serialize;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod link;
pub mod merge;
pub mod names;
pub mod validate;

pub use link::{drop_unlinked, link_parents, project_code, retain_existing, LinkOutcome};
pub use merge::{collapse_by_key, BatchFailure, MergeEngine, MergeOutcome, RowShape};
pub use names::{normalize_group_labels, normalize_name, suggest_aliases, AliasSuggestion, NameAlias};
pub use validate::{validate, validate_all, Validated};

use merge::{column_text, DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE, MIN_BATCH_SIZE};

pub const CRATE_NAME: &str = "fleet-sync";

/// Groups listed in the verification pass.
pub const TOP_GROUPS: usize = 10;
/// Rejections kept per sheet in the report; the counters are always complete.
const REJECTION_SAMPLE: usize = 50;

const VERIFY_COLLECTION: &str = "machines";
const VERIFY_GROUP_FIELD: &str = "project_name";
const VERIFY_LINK_FIELD: &str = "project_id";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub batch_size: usize,
    pub reports_dir: Option<PathBuf>,
    pub all_sheets: bool,
    pub dry_run: bool,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            batch_size: DEFAULT_BATCH_SIZE,
            reports_dir: None,
            all_sheets: false,
            dry_run: false,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source, e.g. a map in tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let workspace_root = lookup("FLEET_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            batch_size: lookup("FLEET_BATCH_SIZE")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE)
                .clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
            reports_dir: lookup("FLEET_REPORTS_DIR").map(PathBuf::from),
            all_sheets: lookup("FLEET_ALL_SHEETS").is_some_and(|v| is_truthy(&v)),
            dry_run: false,
            workspace_root,
        }
    }

    /// Reports root, defaulting to `<workspace_root>/reports`.
    pub fn reports_root(&self) -> PathBuf {
        self.reports_dir
            .clone()
            .unwrap_or_else(|| self.workspace_root.join("reports"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportJob {
    pub path: PathBuf,
    pub mode: EntityMode,
}

impl ImportJob {
    pub fn fixed(path: impl Into<PathBuf>, entity: EntityType) -> Self {
        Self {
            path: path.into(),
            mode: EntityMode::Fixed { entity },
        }
    }

    pub fn detect(path: impl Into<PathBuf>, default: Option<EntityType>) -> Self {
        Self {
            path: path.into(),
            mode: EntityMode::Detect { default },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub rows: usize,
    pub mapped: usize,
    pub rejected: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
    pub recovered_batches: usize,
    pub resolved_links: usize,
    pub unresolved_links: usize,
    pub created_parents: usize,
    /// Update-only rows whose key has no existing target row.
    pub unmatched_targets: usize,
    /// Rows left unwritten because their required link did not resolve.
    pub skipped_unlinked: usize,
}

impl EntityCounts {
    fn absorb(&mut self, other: &EntityCounts) {
        self.rows += other.rows;
        self.mapped += other.mapped;
        self.rejected += other.rejected;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed += other.failed;
        self.recovered_batches += other.recovered_batches;
        self.resolved_links += other.resolved_links;
        self.unresolved_links += other.unresolved_links;
        self.created_parents += other.created_parents;
        self.unmatched_targets += other.unmatched_targets;
        self.skipped_unlinked += other.skipped_unlinked;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SheetReport {
    pub sheet: String,
    pub entity: Option<EntityType>,
    pub header_row: Option<usize>,
    pub column_map: Option<ColumnMap>,
    pub column_shift: Option<usize>,
    pub counts: EntityCounts,
    pub rejections: Vec<Rejection>,
    pub error: Option<IngestError>,
}

impl SheetReport {
    fn failed(sheet: &str, error: IngestError) -> Self {
        Self {
            sheet: sheet.to_string(),
            entity: None,
            header_row: None,
            column_map: None,
            column_shift: None,
            counts: EntityCounts::default(),
            rejections: Vec::new(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path: String,
    pub fingerprint: Option<String>,
    pub sheets: Vec<SheetReport>,
    pub error: Option<IngestError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupCount {
    pub group: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub total: usize,
    pub top_groups: Vec<GroupCount>,
    /// Rows carrying a group label but no parent id.
    pub unlinked: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store: String,
    pub total_rows: usize,
    pub mapped_rows: usize,
    pub rejected_rows: usize,
    pub per_entity: BTreeMap<EntityType, EntityCounts>,
    pub per_group_counts: Vec<GroupCount>,
    pub unresolved_foreign_key_count: usize,
    pub verification: Option<Verification>,
    pub files: Vec<FileReport>,
    pub aliases: Vec<NameAlias>,
    pub alias_suggestions: Vec<AliasSuggestion>,
    pub batch_failures: Vec<BatchFailure>,
}

impl SyncRunSummary {
    pub fn failed_files(&self) -> usize {
        self.files.iter().filter(|f| f.error.is_some()).count()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SchemaRegistry,
    store: Arc<dyn EntityStore>,
    store_label: String,
    merge: MergeEngine,
}

struct SheetRun {
    report: SheetReport,
    aliases: Vec<NameAlias>,
    failures: Vec<BatchFailure>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, registry: SchemaRegistry, store: Arc<dyn EntityStore>) -> Self {
        let merge = MergeEngine::new(config.batch_size);
        Self {
            config,
            registry,
            store,
            store_label: "custom".to_string(),
            merge,
        }
    }

    pub fn with_store_label(mut self, label: impl Into<String>) -> Self {
        self.store_label = label.into();
        self
    }

    /// Registry from the workspace rules; Postgres when a database URL is set and this is not a dry run.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = SchemaRegistry::from_workspace_root(&config.workspace_root)
            .context("loading entity rules")?;
        match (&config.database_url, config.dry_run) {
            (Some(url), false) => {
                let store = PgStore::connect(url, PgStoreConfig::default())
                    .await
                    .context("connecting to the entity store")?;
                Ok(Self::new(config, registry, Arc::new(store)).with_store_label("postgres"))
            }
            _ => Ok(Self::new(config, registry, Arc::new(MemoryStore::new())).with_store_label("memory")),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Runs every job in order. Per-file failures are recorded in the summary, never returned.
    pub async fn run(&self, jobs: &[ImportJob]) -> SyncRunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, files = jobs.len(), store = %self.store_label, "sync run started");

        let mut files = Vec::with_capacity(jobs.len());
        let mut per_entity: BTreeMap<EntityType, EntityCounts> = BTreeMap::new();
        let mut aliases = Vec::new();
        let mut batch_failures = Vec::new();

        for job in jobs {
            let span = info_span!("sync_file", path = %job.path.display());
            let (report, runs) = self.run_job(job).instrument(span).await;
            for run in runs {
                if let Some(entity) = run.report.entity {
                    per_entity.entry(entity).or_default().absorb(&run.report.counts);
                }
                aliases.extend(run.aliases);
                batch_failures.extend(run.failures);
            }
            files.push(report);
        }
        aliases.sort();
        aliases.dedup();

        let verification = self.verify().await;
        let linked_elsewhere = per_entity
            .iter()
            .filter(|(entity, _)| self.registry.schema(**entity).group_label_fields.is_empty())
            .map(|(_, counts)| counts.unresolved_links)
            .sum::<usize>();
        let unresolved_foreign_key_count = match &verification {
            Some(v) => v.unlinked + linked_elsewhere,
            None => per_entity.values().map(|c| c.unresolved_links).sum(),
        } + per_entity.values().map(|c| c.unmatched_targets).sum::<usize>();
        let alias_suggestions = verification
            .as_ref()
            .map(|v| suggest_aliases(v.top_groups.iter().map(|g| g.group.as_str())))
            .unwrap_or_default();

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            store: self.store_label.clone(),
            total_rows: per_entity.values().map(|c| c.rows).sum(),
            mapped_rows: per_entity.values().map(|c| c.mapped).sum(),
            rejected_rows: per_entity.values().map(|c| c.rejected).sum(),
            per_entity,
            per_group_counts: verification
                .as_ref()
                .map(|v| v.top_groups.clone())
                .unwrap_or_default(),
            unresolved_foreign_key_count,
            verification,
            files,
            aliases,
            alias_suggestions,
            batch_failures,
        };
        info!(
            %run_id,
            total_rows = summary.total_rows,
            mapped_rows = summary.mapped_rows,
            rejected_rows = summary.rejected_rows,
            failed_files = summary.failed_files(),
            "sync run finished"
        );
        summary
    }

    async fn run_job(&self, job: &ImportJob) -> (FileReport, Vec<SheetRun>) {
        let path = job.path.clone();
        let read = tokio::task::spawn_blocking(move || read_workbook(&path)).await;
        let workbook: Result<Workbook, IngestError> = match read {
            Ok(result) => result,
            Err(join) => Err(IngestError::FileReadFailure {
                path: job.path.display().to_string(),
                message: join.to_string(),
            }),
        };

        let mut report = FileReport {
            path: job.path.display().to_string(),
            fingerprint: None,
            sheets: Vec::new(),
            error: None,
        };
        let workbook = match workbook {
            Ok(workbook) => workbook,
            Err(err) => {
                warn!(error = %err, "file skipped");
                report.error = Some(err);
                return (report, Vec::new());
            }
        };
        report.fingerprint = Some(workbook.fingerprint.clone());

        let take = if self.config.all_sheets { workbook.sheets.len() } else { 1 };
        let mut runs = Vec::new();
        for sheet in workbook.sheets.iter().take(take) {
            let run = self.run_sheet(sheet, job.mode).await;
            report.sheets.push(run.report.clone());
            runs.push(run);
        }
        if workbook.sheets.is_empty() {
            report.error = Some(IngestError::NoHeaderFound {
                window: self.registry.header_window(None),
            });
        }
        (report, runs)
    }

    async fn run_sheet(&self, sheet: &Sheet, mode: EntityMode) -> SheetRun {
        let plan: SheetPlan = match plan_sheet(&sheet.grid, &self.registry, mode) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(sheet = %sheet.name, error = %err, "sheet skipped");
                return SheetRun {
                    report: SheetReport::failed(&sheet.name, err),
                    aliases: Vec::new(),
                    failures: Vec::new(),
                };
            }
        };
        let schema = self.registry.schema(plan.entity);
        info!(
            sheet = %sheet.name,
            entity = %plan.entity,
            header_row = plan.header.row_index,
            mapped_columns = plan.column_map.len(),
            "sheet planned"
        );

        let drafts = sheet
            .grid
            .rows()
            .iter()
            .enumerate()
            .skip(plan.first_data_row())
            .filter_map(|(row, cells)| build_draft(row, cells, &plan.column_map, schema))
            .collect::<Vec<_>>();
        let mut counts = EntityCounts {
            rows: drafts.len(),
            ..EntityCounts::default()
        };
        let Validated { mut records, rejections } = validate_all(drafts, schema);
        counts.mapped = records.len();
        counts.rejected = rejections.len();
        if !rejections.is_empty() {
            warn!(sheet = %sheet.name, rejected = rejections.len(), "rows rejected");
        }

        if schema.update_existing_only {
            counts.unmatched_targets = retain_existing(self.store.as_ref(), schema, &mut records).await;
        }
        let aliases = normalize_group_labels(&mut records, schema);
        if let Some(fk) = &schema.foreign_key {
            let linked = link_parents(self.store.as_ref(), fk, &mut records, &aliases).await;
            counts.resolved_links = linked.resolved;
            counts.unresolved_links = linked.unresolved;
            counts.created_parents = linked.created_parents;
            counts.skipped_unlinked = drop_unlinked(&mut records, fk);
            if counts.skipped_unlinked > 0 {
                warn!(
                    sheet = %sheet.name,
                    skipped = counts.skipped_unlinked,
                    parent = %fk.parent_collection,
                    "rows skipped for unknown parent"
                );
            }
        }

        let merged = self.merge.merge(self.store.as_ref(), schema, records).await;
        counts.inserted = merged.inserted;
        counts.updated = merged.updated;
        counts.failed = merged.failed;
        counts.recovered_batches = merged.recovered_batches;

        SheetRun {
            report: SheetReport {
                sheet: sheet.name.clone(),
                entity: Some(plan.entity),
                header_row: Some(plan.header.row_index),
                column_map: Some(plan.column_map),
                column_shift: plan.column_shift,
                counts,
                rejections: rejections.into_iter().take(REJECTION_SAMPLE).collect(),
                error: None,
            },
            aliases,
            failures: merged.failures,
        }
    }

    /// Re-reads persisted machines and groups them by normalized project name.
    pub async fn verify(&self) -> Option<Verification> {
        let rows = match self.store.select_all(VERIFY_COLLECTION, None).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "verification read failed");
                return None;
            }
        };

        let mut groups: BTreeMap<String, usize> = BTreeMap::new();
        let mut unlinked = 0;
        for row in &rows {
            let Some(label) = column_text(row, VERIFY_GROUP_FIELD) else {
                continue;
            };
            *groups.entry(normalize_name(&label)).or_default() += 1;
            if column_text(row, VERIFY_LINK_FIELD).is_none() {
                unlinked += 1;
            }
        }

        let mut top_groups = groups
            .into_iter()
            .map(|(group, count)| GroupCount { group, count })
            .collect::<Vec<_>>();
        top_groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.group.cmp(&b.group)));
        top_groups.truncate(TOP_GROUPS);

        Some(Verification {
            total: rows.len(),
            top_groups,
            unlinked,
        })
    }

    /// Writes `sync_brief.md` and `sync_summary.json` under `<reports_root>/<run_id>`.
    pub async fn write_reports(&self, summary: &SyncRunSummary) -> Result<PathBuf> {
        write_reports(&self.config.reports_root(), summary).await
    }
}

fn render_brief(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# Fleet Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Store: {}", summary.store),
        format!(
            "- Rows: {} total, {} mapped, {} rejected",
            summary.total_rows, summary.mapped_rows, summary.rejected_rows
        ),
        format!("- Unresolved links: {}", summary.unresolved_foreign_key_count),
        String::new(),
        "## Entities".to_string(),
    ];
    for (entity, c) in &summary.per_entity {
        lines.push(format!(
            "- {entity}: {} rows, {} inserted, {} updated, {} failed, {} recovered batches",
            c.rows, c.inserted, c.updated, c.failed, c.recovered_batches
        ));
    }

    lines.push(String::new());
    lines.push("## Files".to_string());
    for file in &summary.files {
        match &file.error {
            Some(err) => lines.push(format!("- `{}`: {err}", file.path)),
            None => lines.push(format!("- `{}`: {} sheet(s)", file.path, file.sheets.len())),
        }
        for sheet in &file.sheets {
            match (&sheet.error, sheet.entity) {
                (Some(err), _) => lines.push(format!("  - {}: {err}", sheet.sheet)),
                (None, Some(entity)) => lines.push(format!(
                    "  - {}: {entity}, header row {}, {} mapped / {} rejected",
                    sheet.sheet,
                    sheet.header_row.map(|r| r + 1).unwrap_or(0),
                    sheet.counts.mapped,
                    sheet.counts.rejected
                )),
                (None, None) => {}
            }
        }
    }

    if !summary.per_group_counts.is_empty() {
        lines.push(String::new());
        lines.push("## Top Groups".to_string());
        for group in &summary.per_group_counts {
            lines.push(format!("- {}: {}", group.group, group.count));
        }
    }
    if !summary.alias_suggestions.is_empty() {
        lines.push(String::new());
        lines.push("## Possible Aliases".to_string());
        for s in &summary.alias_suggestions {
            lines.push(format!("- `{}` ~ `{}` ({:.3})", s.label_a, s.label_b, s.similarity));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn write_reports(reports_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join("sync_brief.md"), render_brief(summary))
        .await
        .context("writing sync_brief.md")?;
    let json = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
    fs::write(reports_dir.join("sync_summary.json"), json)
        .await
        .context("writing sync_summary.json")?;
    Ok(reports_dir)
}

/// Markdown index of the most recent runs under `reports_root`.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("sync_summary.json").is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Fleet Sync Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join("sync_summary.json");
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let count = |key: &str| value.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        let files = value
            .get("files")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        lines.push(format!(
            "- finished: {}",
            value.get("finished_at").and_then(|v| v.as_str()).unwrap_or("unknown")
        ));
        lines.push(format!("- files: {files}"));
        lines.push(format!(
            "- rows: {} total, {} mapped, {} rejected",
            count("total_rows"),
            count("mapped_rows"),
            count("rejected_rows")
        ));
        lines.push(format!("- unresolved links: {}", count("unresolved_foreign_key_count")));
        let brief = dir.path().join("sync_brief.md");
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

/// Env-configured run over `jobs`, with reports written when a reports dir is configured.
pub async fn run_sync_once_from_env(jobs: &[ImportJob]) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let write = config.reports_dir.is_some();
    let pipeline = SyncPipeline::from_config(config).await?;
    let summary = pipeline.run(jobs).await;
    if write {
        pipeline.write_reports(&summary).await?;
    }
    Ok(summary)
}
