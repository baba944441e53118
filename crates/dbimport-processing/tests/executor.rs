use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dbimport_bucket::{Bucket, BucketError, BucketRef, LocalBucket, LocalStorage, StorageClient};
use futures::stream::BoxStream;
use dbimport_config::{load_str, PipelineConfig};
use dbimport_processing::{
    FailureKind, FileStatus, ImportContext, ImportOptions, ProcessingError, RuleStatus,
    StorageNotification,
};
use dbimport_table::{MemoryTable, RenderedQuery, Row, Scalar, TableError, TableRef, TableStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const BUCKET: &str = "artifacts";

const CSV_PIPELINE: &str = r#"
pipelines:
  ids:
    bucket_name: artifacts
    table_name: t
    rules:
      - name: csv_ids
        filepath_glob: "*.csv"
        format: csv
        parameters:
          id: { from: csv, column: id }
        sql_condition: "SELECT 1 FROM t WHERE id = ${id}"
"#;

fn pipeline(doc: &str, id: &str) -> PipelineConfig {
    let dir = tempfile::tempdir().unwrap();
    load_str(doc, dir.path()).unwrap().pipeline(id).unwrap().clone()
}

fn storage(files: &[(&str, &str)]) -> TempDir {
    let root = tempfile::tempdir().unwrap();
    let bucket = root.path().join(BUCKET);
    std::fs::create_dir_all(&bucket).unwrap();
    for (key, content) in files {
        let path = bucket.join(key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    root
}

async fn context(root: &Path, pipeline: PipelineConfig, table: Arc<dyn TableStore>) -> ImportContext {
    let storage = LocalStorage::new(root);
    ImportContext::for_pipeline(pipeline, &storage as &dyn StorageClient, table)
        .await
        .unwrap()
}

fn id_row(id: i64) -> Row {
    [("id".to_string(), Scalar::Int(id))].into_iter().collect()
}

/// Counts bulk inserts on top of an in-memory table.
struct CountingTable {
    inner: MemoryTable,
    inserts: AtomicUsize,
}

impl CountingTable {
    fn new() -> Self {
        Self {
            inner: MemoryTable::new(TableRef::new(None, "t")),
            inserts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TableStore for CountingTable {
    fn table_ref(&self) -> &TableRef {
        self.inner.table_ref()
    }

    async fn presence_check(&self, query: &RenderedQuery) -> Result<bool, TableError> {
        self.inner.presence_check(query).await
    }

    async fn insert_rows(&self, rows: &[Row]) -> Result<u64, TableError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.inner.insert_rows(rows).await
    }

    async fn fetch_rows(&self) -> Result<Vec<Row>, TableError> {
        self.inner.fetch_rows().await
    }
}

/// Presence checks that never answer in time.
struct SlowTable(MemoryTable);

#[async_trait]
impl TableStore for SlowTable {
    fn table_ref(&self) -> &TableRef {
        self.0.table_ref()
    }

    async fn presence_check(&self, _query: &RenderedQuery) -> Result<bool, TableError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(false)
    }

    async fn insert_rows(&self, rows: &[Row]) -> Result<u64, TableError> {
        self.0.insert_rows(rows).await
    }

    async fn fetch_rows(&self) -> Result<Vec<Row>, TableError> {
        self.0.fetch_rows().await
    }
}

#[tokio::test]
async fn csv_rule_inserts_once_then_skips() -> Result<()> {
    let root = storage(&[("a.csv", "id\n7\n")]);
    let table = Arc::new(MemoryTable::new(TableRef::new(None, "t")));
    let ctx = context(root.path(), pipeline(CSV_PIPELINE, "ids"), table.clone()).await;

    let first = ctx.process_all(None).await?;
    assert_eq!(first.inserted, 1);
    assert_eq!(table.rows(), vec![id_row(7)]);

    let second = ctx.process_all(None).await?;
    assert_eq!(second.inserted, 0);
    assert!(second.rows.is_empty());
    assert_eq!(second.summary.skipped, 1);
    assert_eq!(second.file("a.csv").unwrap().status, FileStatus::Skipped);
    assert_eq!(table.rows().len(), 1);
    Ok(())
}

#[tokio::test]
async fn processing_the_same_blob_twice_is_idempotent() -> Result<()> {
    let root = storage(&[("a.csv", "id\n7\n")]);
    let table = Arc::new(MemoryTable::new(TableRef::new(None, "t")));
    let ctx = context(root.path(), pipeline(CSV_PIPELINE, "ids"), table.clone()).await;

    assert_eq!(ctx.process_one("a.csv").await?.inserted, 1);
    let again = ctx.process_one("a.csv").await?;
    assert_eq!(again.inserted, 0);
    assert_eq!(again.files[0].rules[0].status, RuleStatus::Skipped);
    assert_eq!(table.rows().len(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_blob_is_not_found_and_inserts_nothing() {
    let root = storage(&[("a.csv", "id\n7\n")]);
    let table = Arc::new(CountingTable::new());
    let ctx = context(root.path(), pipeline(CSV_PIPELINE, "ids"), table.clone()).await;

    let err = ctx.process_one("missing.csv").await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");
    assert_eq!(table.inserts.load(Ordering::SeqCst), 0);
    assert!(table.inner.rows().is_empty());
}

#[tokio::test]
async fn two_matching_rules_produce_two_rows_in_one_insert() -> Result<()> {
    let doc = r#"
pipelines:
  both:
    bucket_name: artifacts
    table_name: t
    rules:
      - name: by_id
        filepath_glob: "*.csv"
        format: csv
        parameters:
          id: { from: csv, column: id }
      - name: by_name
        filepath_regex: '^(?P<stem>[a-z]+)\.csv$'
        parameters:
          stem: { from: path, group: stem }
"#;
    let root = storage(&[("a.csv", "id\n7\n")]);
    let table = Arc::new(CountingTable::new());
    let ctx = context(root.path(), pipeline(doc, "both"), table.clone()).await;

    let report = ctx.process_one("a.csv").await?;
    assert_eq!(report.inserted, 2);
    assert_eq!(table.inserts.load(Ordering::SeqCst), 1);
    assert_eq!(report.rows[0], id_row(7));
    assert_eq!(report.rows[1].get("stem"), Some(&Scalar::Text("a".into())));
    Ok(())
}

#[tokio::test]
async fn one_malformed_blob_does_not_block_the_batch() -> Result<()> {
    let root = storage(&[
        ("a.csv", "id\n1\n"),
        ("b.csv", "id\n2,extra\n"),
        ("nested/c.csv", "id\n3\n"),
        ("notes.txt", "ignored"),
    ]);
    let table = Arc::new(MemoryTable::new(TableRef::new(None, "t")));
    let ctx = context(root.path(), pipeline(CSV_PIPELINE, "ids"), table.clone()).await;

    let report = ctx.process_all(None).await?;
    assert_eq!(report.inserted, 2);
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.failures_of(FailureKind::Extraction), 1);
    assert_eq!(report.file("b.csv").unwrap().status, FileStatus::Failed);
    assert_eq!(report.file("notes.txt").unwrap().status, FileStatus::Ignored);

    let blobs: Vec<&str> = report.files.iter().map(|f| f.blob.as_str()).collect();
    assert_eq!(blobs, vec!["a.csv", "b.csv", "nested/c.csv", "notes.txt"]);
    Ok(())
}

#[tokio::test]
async fn insert_failures_are_fatal() {
    let root = storage(&[("a.csv", "id\n7\n")]);
    let table = Arc::new(MemoryTable::new(TableRef::new(None, "t")).with_columns(["other"]));
    let ctx = context(root.path(), pipeline(CSV_PIPELINE, "ids"), table).await;

    let err = ctx.process_all(None).await.unwrap_err();
    assert!(matches!(
        err,
        ProcessingError::Insert {
            source: TableError::SchemaMismatch { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn dry_run_evaluates_without_inserting() -> Result<()> {
    let root = storage(&[("a.csv", "id\n7\n")]);
    let table = Arc::new(MemoryTable::new(TableRef::new(None, "t")));
    let ctx = context(root.path(), pipeline(CSV_PIPELINE, "ids"), table.clone())
        .await
        .with_options(ImportOptions {
            dry_run: true,
            ..Default::default()
        });

    let report = ctx.process_all(None).await?;
    assert!(report.dry_run);
    assert_eq!(report.rows, vec![id_row(7)]);
    assert_eq!(report.inserted, 0);
    assert!(table.rows().is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelled_invocations_stop() {
    let root = storage(&[("a.csv", "id\n7\n")]);
    let table = Arc::new(MemoryTable::new(TableRef::new(None, "t")));
    let cancel = CancellationToken::new();
    let ctx = context(root.path(), pipeline(CSV_PIPELINE, "ids"), table.clone())
        .await
        .with_cancellation(cancel.clone());

    cancel.cancel();
    let err = ctx.process_all(None).await.unwrap_err();
    assert!(matches!(err, ProcessingError::Cancelled));
    assert!(table.rows().is_empty());
}

#[tokio::test]
async fn slow_presence_checks_hit_the_deadline() {
    let root = storage(&[("a.csv", "id\n7\n")]);
    let table = Arc::new(SlowTable(MemoryTable::new(TableRef::new(None, "t"))));
    let ctx = context(root.path(), pipeline(CSV_PIPELINE, "ids"), table.clone())
        .await
        .with_options(ImportOptions {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        });

    let err = ctx.process_one("a.csv").await.unwrap_err();
    assert!(matches!(err, ProcessingError::DeadlineExceeded));
    assert!(table.0.rows().is_empty());
}

#[tokio::test]
async fn notifications_are_validated_before_processing() -> Result<()> {
    let root = storage(&[("a.csv", "id\n7\n")]);
    let table = Arc::new(MemoryTable::new(TableRef::new(None, "t")));
    let ctx = context(root.path(), pipeline(CSV_PIPELINE, "ids"), table.clone()).await;

    let mut deleted = StorageNotification::finalized(BUCKET, "a.csv");
    deleted.event_type = "google.cloud.storage.object.v1.deleted".into();
    assert!(matches!(
        ctx.process_notification(&deleted).await,
        Err(ProcessingError::Notification(_))
    ));
    assert!(table.rows().is_empty());

    let report = ctx
        .process_notification(&StorageNotification::finalized(BUCKET, "a.csv"))
        .await?;
    assert_eq!(report.inserted, 1);
    Ok(())
}

#[tokio::test]
async fn presence_checks_use_snippets_and_table_identifiers() -> Result<()> {
    let doc = r#"
snippets:
  same_run: "run = ${run}"
pipelines:
  runs:
    bucket_name: artifacts
    table_name: bench.results
    rules:
      - name: json_runs
        filepath_regex: '^(?P<run>[0-9]+)\.json$'
        format: json
        parameters:
          run: { from: path, group: run, type: integer }
          score: { from: json, pointer: /score }
        sql_condition: "SELECT 1 FROM ${dataset}.${table} WHERE ${snippets.same_run}"
"#;
    let root = storage(&[("1.json", r#"{"score": 0.5}"#), ("2.json", r#"{"score": 0.7}"#)]);
    let existing: Row = [
        ("run".to_string(), Scalar::Int(1)),
        ("score".to_string(), Scalar::Float(0.5)),
    ]
    .into_iter()
    .collect();
    let table = Arc::new(MemoryTable::new("bench.results".parse()?).with_rows(vec![existing]));
    let ctx = context(root.path(), pipeline(doc, "runs"), table.clone()).await;

    let report = ctx.process_all(None).await?;
    assert_eq!(report.inserted, 1);
    assert_eq!(report.file("1.json").unwrap().status, FileStatus::Skipped);
    assert_eq!(report.file("2.json").unwrap().status, FileStatus::Imported);
    assert_eq!(table.rows().len(), 2);
    Ok(())
}

/// Lists what is on disk, but reports `gone` keys as deleted once they are
/// read, like an object removed between listing and download.
#[derive(Debug)]
struct VanishingBucket {
    inner: LocalBucket,
    gone: &'static str,
}

#[async_trait]
impl Bucket for VanishingBucket {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list_keys<'a>(&'a self, prefix: Option<&'a str>) -> BoxStream<'a, Result<String, BucketError>> {
        self.inner.list_keys(prefix)
    }

    async fn read(&self, key: &str) -> Result<Bytes, BucketError> {
        if key == self.gone {
            return Err(BucketError::NotFound {
                bucket: self.name().to_string(),
                key: key.to_string(),
            });
        }
        self.inner.read(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, BucketError> {
        self.inner.exists(key).await
    }
}

#[tokio::test]
async fn blobs_deleted_after_listing_are_reported_as_vanished() -> Result<()> {
    let root = storage(&[("a.csv", "id\n1\n"), ("gone.csv", "id\n2\n")]);
    let bucket: BucketRef = Arc::new(VanishingBucket {
        inner: LocalStorage::new(root.path()).bucket(BUCKET),
        gone: "gone.csv",
    });
    let table = Arc::new(CountingTable::new());
    let ctx = ImportContext::new(pipeline(CSV_PIPELINE, "ids"), bucket, table.clone());

    let report = ctx.process_all(None).await?;
    assert_eq!(report.summary.vanished, 1);
    assert_eq!(report.file("gone.csv").unwrap().status, FileStatus::Vanished);
    assert_eq!(report.file("a.csv").unwrap().status, FileStatus::Imported);
    assert_eq!(report.inserted, 1);

    let err = ctx.process_one("gone.csv").await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert!(matches!(err, ProcessingError::NotFound { ref name, .. } if name == "gone.csv"));
    assert_eq!(table.inserts.load(Ordering::SeqCst), 1);
    Ok(())
}
