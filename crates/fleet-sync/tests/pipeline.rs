use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_adapters::SchemaRegistry;
use fleet_core::{EntityType, IngestError, StoreRow};
use fleet_storage::{EntityStore, MemoryStore, RowFilter, StoreError, StoreErrorKind, WriteOutcome};
use fleet_sync::{report_recent_markdown, ImportJob, SyncConfig, SyncPipeline};
use serde_json::json;

fn write_csv(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn pipeline_with(store: Arc<dyn EntityStore>, batch_size: usize) -> SyncPipeline {
    let config = SyncConfig {
        batch_size,
        ..SyncConfig::default()
    };
    SyncPipeline::new(config, SchemaRegistry::builtin(), store)
}

const MACHINES: &str = "BÁO CÁO THIẾT BỊ,,,\n\
Mã quản lý,Tên máy móc,Dự án,Tình trạng\n\
4C0001,Xe tải,(QLTB) Kho Tổng,Hỏng\n\
4C0002,Máy xúc,Cổ Loa,Đang hoạt động\n";

#[tokio::test]
async fn machine_rows_are_normalized_and_linked() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(dir.path(), "machines.csv", MACHINES);
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline_with(store.clone(), 500);

    let summary = pipeline.run(&[ImportJob::detect(&path, None)]).await;
    assert_eq!(summary.total_rows, 2);
    assert_eq!(summary.mapped_rows, 2);
    assert_eq!(summary.unresolved_foreign_key_count, 0);
    assert_eq!(summary.files[0].sheets[0].entity, Some(EntityType::Machine));
    assert_eq!(summary.files[0].sheets[0].header_row, Some(1));

    let machines = store.rows("machines").await;
    let truck = machines.iter().find(|r| r["code"] == json!("4C0001")).unwrap();
    assert_eq!(truck["project_name"], json!("Lưu Kho"));
    assert_eq!(truck["status"], json!("broken"));
    assert!(truck["project_id"].is_string());

    let projects = store.rows("projects").await;
    assert_eq!(projects.len(), 2);
    let storage = projects.iter().find(|p| p["name"] == json!("Lưu Kho")).unwrap();
    assert_eq!(storage["id"], truck["project_id"]);
    assert!(summary.aliases.iter().any(|a| a.raw == "(QLTB) Kho Tổng"));
    assert_eq!(summary.per_entity[&EntityType::Machine].created_parents, 2);
}

#[tokio::test]
async fn standards_with_blank_code_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(
        dir.path(),
        "standards.csv",
        "Mã xe,Định mức,Chu kỳ\nXE01,Bảo dưỡng 500h,500\n,Bảo dưỡng 250h,250\n",
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline_with(store.clone(), 500);

    let summary = pipeline
        .run(&[ImportJob::fixed(&path, EntityType::MaintenanceStandard)])
        .await;
    assert_eq!(summary.mapped_rows, 1);
    assert_eq!(summary.rejected_rows, 1);
    let sheet = &summary.files[0].sheets[0];
    assert_eq!(sheet.rejections[0].row, 2);
    assert_eq!(sheet.rejections[0].missing, vec!["machine_code".to_string()]);

    let rows = store.rows("maintenance_standards").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["machine_code"], json!("XE01"));
    assert_eq!(rows[0]["interval_hours"], json!(500));
}

#[tokio::test]
async fn rerun_updates_master_data_and_appends_history() {
    let dir = tempfile::tempdir().unwrap();
    let machines = write_csv(dir.path(), "machines.csv", MACHINES);
    let history = write_csv(
        dir.path(),
        "history.csv",
        "Mã tài sản,Ngày thực hiện,Nội dung\n4C0001,15/03/2023,Thay dầu\n",
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline_with(store.clone(), 500);
    let jobs = [
        ImportJob::fixed(&machines, EntityType::Machine),
        ImportJob::fixed(&history, EntityType::MaintenanceHistory),
    ];

    pipeline.run(&jobs).await;
    let second = pipeline.run(&jobs).await;

    let counts = &second.per_entity[&EntityType::Machine];
    assert_eq!((counts.inserted, counts.updated), (0, 2));
    assert_eq!(counts.created_parents, 0);
    assert_eq!(store.count("machines").await, 2);
    assert_eq!(store.count("projects").await, 2);
    assert_eq!(store.count("maintenance_history").await, 2);
}

#[tokio::test]
async fn daily_logs_fall_back_to_legacy_layout() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(
        dir.path(),
        "logs.csv",
        "Mã xe,Ngày,Giờ hoạt động,Nhiên liệu,Ghi chú\n\
         XE01,02/01/2024,8,40,Chạy ca ngày\n\
         XE99,03/01/2024,4,20,\n",
    );
    let store = Arc::new(MemoryStore::new());
    store
        .insert(
            "machines",
            &[json!({"id": "m-1", "code": "XE01"}).as_object().cloned().unwrap()],
        )
        .await
        .unwrap();
    store
        .define_collection("daily_logs", &["machine_code", "date", "note", "hours_added"])
        .await;
    let pipeline = pipeline_with(store.clone(), 500);

    let summary = pipeline.run(&[ImportJob::fixed(&path, EntityType::DailyLog)]).await;
    let counts = &summary.per_entity[&EntityType::DailyLog];
    assert_eq!((counts.inserted, counts.failed), (1, 0));
    assert_eq!(counts.recovered_batches, 1);
    assert_eq!(counts.unresolved_links, 1);
    assert_eq!(counts.skipped_unlinked, 1);
    assert_eq!(summary.unresolved_foreign_key_count, 1);
    assert!(summary.batch_failures.is_empty());

    let logs = store.rows("daily_logs").await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["machine_code"], json!("XE01"));
    assert_eq!(logs[0]["note"], json!("Chạy ca ngày"));
    assert_eq!(logs[0]["hours_added"], json!(8));
    assert!(!logs[0].contains_key("fuel_consumed"));
    assert!(!logs[0].contains_key("machine_id"));
    assert_eq!(store.count("machines").await, 1);
}

#[tokio::test]
async fn daily_logs_for_unknown_machines_are_not_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(
        dir.path(),
        "logs.csv",
        "Mã xe,Ngày,Giờ hoạt động,Ghi chú\n\
         XE01,02/01/2024,8,Chạy ca ngày\n\
         XE99,03/01/2024,4,\n",
    );
    let store = Arc::new(MemoryStore::new());
    store
        .insert(
            "machines",
            &[json!({"id": "m-1", "code": "XE01"}).as_object().cloned().unwrap()],
        )
        .await
        .unwrap();
    store
        .define_collection("daily_logs", &["machine_id", "date", "hours_added", "notes"])
        .await;
    let pipeline = pipeline_with(store.clone(), 500);

    let summary = pipeline.run(&[ImportJob::fixed(&path, EntityType::DailyLog)]).await;
    let counts = &summary.per_entity[&EntityType::DailyLog];
    assert_eq!((counts.inserted, counts.failed), (1, 0));
    assert_eq!(counts.recovered_batches, 0);
    assert_eq!(counts.unresolved_links, 1);
    assert!(summary.batch_failures.is_empty());

    let logs = store.rows("daily_logs").await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["machine_id"], json!("m-1"));
    assert!(!logs[0].contains_key("machine_code"));
}

#[tokio::test]
async fn each_machine_keeps_all_of_its_standards() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(
        dir.path(),
        "standards.csv",
        "Mã xe,Định mức,Chu kỳ\n\
         XE01,Bảo dưỡng 250h,250\n\
         XE01,Bảo dưỡng 500h,500\n\
         XE01,Bảo dưỡng 1000h,1000\n\
         XE02,Bảo dưỡng 250h,250\n",
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline_with(store.clone(), 500);
    let job = [ImportJob::fixed(&path, EntityType::MaintenanceStandard)];

    let first = pipeline.run(&job).await;
    assert_eq!(first.per_entity[&EntityType::MaintenanceStandard].inserted, 4);
    let second = pipeline.run(&job).await;
    let counts = &second.per_entity[&EntityType::MaintenanceStandard];
    assert_eq!((counts.inserted, counts.updated), (0, 4));

    let rows = store.rows("maintenance_standards").await;
    let xe01 = rows.iter().filter(|r| r["machine_code"] == json!("XE01")).count();
    assert_eq!((rows.len(), xe01), (4, 3));
}

#[tokio::test]
async fn project_mapping_never_creates_machines() {
    let dir = tempfile::tempdir().unwrap();
    let machines = write_csv(dir.path(), "machines.csv", MACHINES);
    let mapping = write_csv(
        dir.path(),
        "mapping.csv",
        "Mã tài sản,Dự án\n4C0002,Kho Tổng\nNEW01,Cổ Loa Mới\n",
    );
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline_with(store.clone(), 500);

    pipeline.run(&[ImportJob::fixed(&machines, EntityType::Machine)]).await;
    let summary = pipeline
        .run(&[ImportJob::fixed(&mapping, EntityType::ProjectMapping)])
        .await;
    let counts = &summary.per_entity[&EntityType::ProjectMapping];
    assert_eq!(counts.unmatched_targets, 1);
    assert_eq!((counts.inserted, counts.updated), (0, 1));
    assert!(summary.unresolved_foreign_key_count >= 1);

    let rows = store.rows("machines").await;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["code"] != json!("NEW01")));
    let excavator = rows.iter().find(|r| r["code"] == json!("4C0002")).unwrap();
    assert_eq!(excavator["project_name"], json!("Lưu Kho"));

    let projects = store.rows("projects").await;
    assert!(projects.iter().all(|p| p["name"] != json!("Cổ Loa Mới")));
}

/// Fails any write that carries the poisoned machine code.
struct FlakyStore {
    inner: MemoryStore,
    poisoned: &'static str,
}

impl FlakyStore {
    fn check(&self, rows: &[StoreRow]) -> Result<(), StoreError> {
        if rows.iter().any(|r| r.get("machine_code") == Some(&json!(self.poisoned))) {
            return Err(StoreError::new(StoreErrorKind::Constraint, "check constraint violated"));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for FlakyStore {
    async fn upsert(
        &self,
        collection: &str,
        rows: &[StoreRow],
        conflict_key: &[&str],
    ) -> Result<WriteOutcome, StoreError> {
        self.check(rows)?;
        self.inner.upsert(collection, rows, conflict_key).await
    }

    async fn insert(&self, collection: &str, rows: &[StoreRow]) -> Result<WriteOutcome, StoreError> {
        self.check(rows)?;
        self.inner.insert(collection, rows).await
    }

    async fn select_all(
        &self,
        collection: &str,
        filter: Option<&RowFilter>,
    ) -> Result<Vec<StoreRow>, StoreError> {
        self.inner.select_all(collection, filter).await
    }
}

#[tokio::test]
async fn failed_batch_does_not_stop_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(
        dir.path(),
        "history.csv",
        "Mã tài sản,Ngày thực hiện,Nội dung\n\
         4C0001,15/03/2023,Thay dầu\n\
         BAD1,16/03/2023,Thay lọc\n\
         4C0002,17/03/2023,Kiểm tra\n",
    );
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        poisoned: "BAD1",
    });
    let pipeline = pipeline_with(store.clone(), 1);

    let summary = pipeline
        .run(&[ImportJob::fixed(&path, EntityType::MaintenanceHistory)])
        .await;
    let counts = &summary.per_entity[&EntityType::MaintenanceHistory];
    assert_eq!((counts.inserted, counts.failed), (2, 1));
    assert_eq!(summary.batch_failures.len(), 1);
    assert_eq!(summary.batch_failures[0].batch_index, 1);
    assert_eq!(store.inner.count("maintenance_history").await, 2);
}

#[tokio::test]
async fn bad_files_and_sheets_are_reported_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let no_header = write_csv(dir.path(), "blank.csv", "xin chào,thế giới\n1,2\n");
    let machines = write_csv(dir.path(), "machines.csv", MACHINES);
    let pipeline = pipeline_with(Arc::new(MemoryStore::new()), 500);

    let summary = pipeline
        .run(&[
            ImportJob::detect(dir.path().join("gone.xlsx"), None),
            ImportJob::fixed(&no_header, EntityType::Machine),
            ImportJob::fixed(&machines, EntityType::Machine),
        ])
        .await;

    assert_eq!(summary.failed_files(), 1);
    assert!(matches!(summary.files[0].error, Some(IngestError::FileReadFailure { .. })));
    assert!(matches!(
        summary.files[1].sheets[0].error,
        Some(IngestError::NoHeaderFound { .. })
    ));
    assert_eq!(summary.mapped_rows, 2);
}

#[tokio::test]
async fn reports_land_in_run_directory_and_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_csv(dir.path(), "machines.csv", MACHINES);
    let config = SyncConfig {
        reports_dir: Some(dir.path().join("reports")),
        ..SyncConfig::default()
    };
    let pipeline = SyncPipeline::new(config, SchemaRegistry::builtin(), Arc::new(MemoryStore::new()));

    let summary = pipeline.run(&[ImportJob::detect(&path, None)]).await;
    let run_dir = pipeline.write_reports(&summary).await.unwrap();
    assert!(run_dir.ends_with(summary.run_id.to_string()));

    let brief = std::fs::read_to_string(run_dir.join("sync_brief.md")).unwrap();
    assert!(brief.contains("Lưu Kho: 1"));
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join("sync_summary.json")).unwrap()).unwrap();
    assert_eq!(json["mapped_rows"], json!(2));

    let index = report_recent_markdown(3, &dir.path().join("reports")).unwrap();
    assert!(index.contains(&format!("## Run `{}`", summary.run_id)));
    assert!(index.contains("rows: 2 total, 2 mapped, 0 rejected"));
}
