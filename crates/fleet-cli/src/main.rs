use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleet_adapters::{build_draft, plan_sheet, read_workbook, EntityMode, SchemaRegistry};
use fleet_core::EntityType;
use fleet_sync::{report_recent_markdown, ImportJob, SyncConfig, SyncPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fleet-cli")]
#[command(about = "Fleet workbook sync command-line interface")]
struct Cli {
    /// Log at debug level unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import workbooks into the entity store.
    Sync {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Treat every sheet as this entity.
        #[arg(long, conflicts_with = "default_entity")]
        entity: Option<EntityType>,
        /// Fallback when a sheet's entity cannot be detected.
        #[arg(long)]
        default_entity: Option<EntityType>,
        /// Write to an in-memory store instead of DATABASE_URL.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// Print the detected header, entity and column map of a workbook.
    Inspect { file: PathBuf },
    /// List recent sync runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn inspect(file: PathBuf) -> Result<()> {
    let workbook = read_workbook(&file).with_context(|| format!("reading {}", file.display()))?;
    let registry = SchemaRegistry::from_workspace_root(&SyncConfig::from_env().workspace_root)?;
    println!("file: {} ({})", file.display(), workbook.fingerprint);

    for sheet in &workbook.sheets {
        println!("\n== sheet `{}` ({} rows)", sheet.name, sheet.grid.len());
        let plan = match plan_sheet(&sheet.grid, &registry, EntityMode::Detect { default: None }) {
            Ok(plan) => plan,
            Err(err) => {
                println!("  {err}");
                continue;
            }
        };
        println!("  header row: {} (score {})", plan.header.row_index + 1, plan.header.match_score);
        println!("  entity: {}", plan.entity);
        if let Some(offset) = plan.column_shift {
            println!("  column shift: +{offset}");
        }
        println!("  columns:");
        for (column, field) in plan.column_map.iter() {
            let raw = plan.header.raw_labels.get(column).map(String::as_str).unwrap_or("");
            println!("    [{column}] {raw:?} -> {field}");
        }

        let schema = registry.schema(plan.entity);
        let first = sheet
            .grid
            .rows()
            .iter()
            .enumerate()
            .skip(plan.first_data_row())
            .find_map(|(row, cells)| build_draft(row, cells, &plan.column_map, schema));
        match first {
            Some(draft) => {
                let fields = draft
                    .fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect::<serde_json::Map<_, _>>();
                println!("  first data row ({}): {}", draft.source_row + 1, serde_json::Value::Object(fields));
            }
            None => println!("  no data rows"),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Sync {
            files,
            entity,
            default_entity,
            dry_run,
            reports_dir,
        } => {
            let mut config = SyncConfig::from_env();
            config.dry_run = dry_run;
            if reports_dir.is_some() {
                config.reports_dir = reports_dir;
            }
            let write_reports = config.reports_dir.is_some();

            let jobs = files
                .into_iter()
                .map(|path| match entity {
                    Some(entity) => ImportJob::fixed(path, entity),
                    None => ImportJob::detect(path, default_entity),
                })
                .collect::<Vec<_>>();
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run(&jobs).await;
            let reports = if write_reports {
                pipeline.write_reports(&summary).await?.display().to_string()
            } else {
                "-".to_string()
            };
            println!(
                "sync complete: run_id={} files={} rows={} mapped={} rejected={} unresolved={} failed_files={} reports={}",
                summary.run_id,
                summary.files.len(),
                summary.total_rows,
                summary.mapped_rows,
                summary.rejected_rows,
                summary.unresolved_foreign_key_count,
                summary.failed_files(),
                reports
            );
        }
        Commands::Inspect { file } => inspect(file)?,
        Commands::Report { runs } => {
            let root = SyncConfig::from_env().reports_root();
            print!("{}", report_recent_markdown(runs, &root)?);
        }
    }

    Ok(())
}
