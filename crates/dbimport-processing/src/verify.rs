//! Replays fixture files through a pipeline and compares the table content
//! with the expected rows.
//!
//! A fixture directory looks like:
//!
//! ```text
//! fixture/
//!   expected.json          # [ {row}, ... ] or {"key": [...], "rows": [...]}
//!   <bucket_name>/...      # blobs served by the local storage double
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dbimport_bucket::{LocalStorage, StorageClient};
use dbimport_config::PipelineConfig;
use dbimport_table::{Row, TableError, TableStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::error::ProcessingError;
use crate::executor::{ImportContext, ImportOptions};
use crate::report::ImportReport;

pub const EXPECTED_FILE: &str = "expected.json";

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid expectations in {}: {source}", .path.display())]
    Expectations {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("fixture {} has no directory for bucket '{bucket}'", .root.display())]
    MissingBucket { root: PathBuf, bucket: String },

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("reading back the scratch table failed: {0}")]
    Table(#[from] TableError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpectedRows {
    /// Columns identifying a logical record; used to pair missing and
    /// unexpected rows into mismatches.
    #[serde(default)]
    pub key: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpectedFile {
    Rows(Vec<Row>),
    Keyed(ExpectedRows),
}

#[derive(Debug, Clone)]
pub struct VerificationFixture {
    pub root: PathBuf,
    pub expected: ExpectedRows,
}

impl VerificationFixture {
    pub fn load(root: &Path) -> Result<Self, VerifyError> {
        let path = root.join(EXPECTED_FILE);
        let text = std::fs::read_to_string(&path).map_err(|source| VerifyError::Io {
            path: path.clone(),
            source,
        })?;
        let expected = match serde_json::from_str(&text)
            .map_err(|source| VerifyError::Expectations { path, source })?
        {
            ExpectedFile::Rows(rows) => ExpectedRows {
                key: Vec::new(),
                rows,
            },
            ExpectedFile::Keyed(expected) => expected,
        };
        Ok(Self {
            root: root.to_path_buf(),
            expected,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RowMismatch {
    pub expected: Row,
    pub actual: Row,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub pipeline: String,
    pub table: String,
    pub passed: bool,
    pub expected: usize,
    pub actual: usize,
    pub missing: Vec<Row>,
    pub unexpected: Vec<Row>,
    pub mismatched: Vec<RowMismatch>,
    /// Rows stored by a second pass over the same fixtures; anything but
    /// zero means the pipeline is not idempotent.
    pub rerun_inserted: u64,
    pub import: ImportReport,
}

/// Runs the pipeline in batch mode over the fixture's bucket directory into
/// `table`, which must be a disposable, initially empty table.
pub async fn run(
    pipeline: &PipelineConfig,
    fixture: &VerificationFixture,
    table: Arc<dyn TableStore>,
    options: ImportOptions,
) -> Result<VerificationReport, VerifyError> {
    let bucket_dir = fixture.root.join(&pipeline.bucket_name);
    if !bucket_dir.is_dir() {
        return Err(VerifyError::MissingBucket {
            root: fixture.root.clone(),
            bucket: pipeline.bucket_name.clone(),
        });
    }

    let storage = LocalStorage::new(fixture.root.clone());
    let options = ImportOptions {
        dry_run: false,
        ..options
    };
    let ctx = ImportContext::for_pipeline(pipeline.clone(), &storage as &dyn StorageClient, table.clone())
        .await?
        .with_options(options);

    let import = ctx.process_all(None).await?;
    let actual = table.fetch_rows().await?;
    let rerun = ctx.process_all(None).await?;

    let comparison = compare(&fixture.expected, actual);
    let passed = comparison.missing.is_empty()
        && comparison.unexpected.is_empty()
        && comparison.mismatched.is_empty()
        && rerun.inserted == 0;

    info!(
        pipeline = %pipeline.id,
        passed,
        missing = comparison.missing.len(),
        unexpected = comparison.unexpected.len(),
        mismatched = comparison.mismatched.len(),
        rerun_inserted = rerun.inserted,
        "verification finished"
    );

    Ok(VerificationReport {
        pipeline: pipeline.id.clone(),
        table: table.table_ref().to_string(),
        passed,
        expected: fixture.expected.rows.len(),
        actual: comparison.actual,
        missing: comparison.missing,
        unexpected: comparison.unexpected,
        mismatched: comparison.mismatched,
        rerun_inserted: rerun.inserted,
        import,
    })
}

#[derive(Debug, Default)]
struct Comparison {
    actual: usize,
    missing: Vec<Row>,
    unexpected: Vec<Row>,
    mismatched: Vec<RowMismatch>,
}

/// Multiset comparison. Actual rows are projected onto the columns the
/// expectations mention, so columns the table fills on its own (serial ids,
/// defaults) do not count as differences.
fn compare(expected: &ExpectedRows, actual: Vec<Row>) -> Comparison {
    let columns: BTreeSet<&str> = expected.rows.iter().flat_map(Row::columns).collect();
    let project = |row: Row| -> Row {
        if columns.is_empty() {
            return row;
        }
        row.iter()
            .filter(|(column, _)| columns.contains(column))
            .map(|(column, value)| (column.to_string(), value.clone()))
            .collect()
    };

    let mut remaining: BTreeMap<String, Vec<Row>> = BTreeMap::new();
    for row in &expected.rows {
        remaining.entry(row.canonical()).or_default().push(row.clone());
    }

    let mut comparison = Comparison {
        actual: actual.len(),
        ..Default::default()
    };
    for row in actual.into_iter().map(project) {
        match remaining.get_mut(&row.canonical()).and_then(Vec::pop) {
            Some(_) => {}
            None => comparison.unexpected.push(row),
        }
    }
    comparison.missing = remaining.into_values().flatten().collect();

    if !expected.key.is_empty() {
        let same_key = |a: &Row, b: &Row| {
            expected
                .key
                .iter()
                .all(|column| match (a.get(column), b.get(column)) {
                    (Some(x), Some(y)) => x.normalized() == y.normalized(),
                    _ => false,
                })
        };
        let mut still_missing = Vec::new();
        for missing in std::mem::take(&mut comparison.missing) {
            match comparison
                .unexpected
                .iter()
                .position(|actual| same_key(&missing, actual))
            {
                Some(index) => comparison.mismatched.push(RowMismatch {
                    expected: missing,
                    actual: comparison.unexpected.remove(index),
                }),
                None => still_missing.push(missing),
            }
        }
        comparison.missing = still_missing;
    }

    comparison.unexpected.sort_by_key(Row::canonical);
    comparison
}
