//! Drives the rule engine over one blob or a whole bucket and performs the
//! single bulk insert of an invocation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dbimport_bucket::{Blob, BucketExt, BucketRef, StorageClient};
use dbimport_config::PipelineConfig;
use dbimport_table::{Row, TableStore};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{evaluate, RuleOutcome};
use crate::error::{ProcessingError, Result};
use crate::extract::needs_content;
use crate::notification::StorageNotification;
use crate::report::{FileReport, FileStatus, ImportReport, ImportSummary, RuleReport};

pub const DEFAULT_BLOB_CONCURRENCY: usize = 8;
pub const DEFAULT_RULE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Blobs evaluated at once in batch mode.
    pub blob_concurrency: usize,
    /// Rules evaluated at once for a single blob.
    pub rule_concurrency: usize,
    /// Wall-clock budget of one invocation.
    pub timeout: Option<Duration>,
    /// Evaluate everything, including presence checks, but insert nothing.
    pub dry_run: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            blob_concurrency: DEFAULT_BLOB_CONCURRENCY,
            rule_concurrency: DEFAULT_RULE_CONCURRENCY,
            timeout: None,
            dry_run: false,
        }
    }
}

/// Everything one pipeline needs to import: its configuration, the source
/// bucket and the target table. Cheap to clone; clones share the
/// cancellation token.
#[derive(Clone)]
pub struct ImportContext {
    pipeline: Arc<PipelineConfig>,
    bucket: BucketRef,
    table: Arc<dyn TableStore>,
    options: ImportOptions,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ImportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportContext")
            .field("pipeline", &self.pipeline.id)
            .field("bucket", &self.bucket.name())
            .field("table", self.table.table_ref())
            .field("options", &self.options)
            .finish()
    }
}

impl ImportContext {
    pub fn new(
        pipeline: impl Into<Arc<PipelineConfig>>,
        bucket: BucketRef,
        table: Arc<dyn TableStore>,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            bucket,
            table,
            options: ImportOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Resolves the pipeline's bucket through `storage`.
    pub async fn for_pipeline(
        pipeline: impl Into<Arc<PipelineConfig>>,
        storage: &dyn StorageClient,
        table: Arc<dyn TableStore>,
    ) -> Result<Self> {
        let pipeline = pipeline.into();
        let bucket = storage
            .get_bucket(&pipeline.bucket_name)
            .await
            .map_err(ProcessingError::Storage)?;
        Ok(Self::new(pipeline, bucket, table))
    }

    pub fn with_options(mut self, options: ImportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    pub fn bucket(&self) -> &BucketRef {
        &self.bucket
    }

    pub fn table(&self) -> &Arc<dyn TableStore> {
        &self.table
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Imports a single blob. A missing blob is [`ProcessingError::NotFound`]
    /// and nothing is inserted.
    pub async fn process_one(&self, name: &str) -> Result<ImportReport> {
        let invocation = self.invocation();
        info!(pipeline = %self.pipeline.id, blob = name, "processing blob");

        let blob = self.bucket.blob(name);
        let exists = invocation
            .guard(blob.exists())
            .await?
            .map_err(ProcessingError::Storage)?;
        if !exists {
            return Err(self.not_found(name));
        }

        let (file, rows) = invocation.process_blob(&blob).await?;
        if file.status == FileStatus::Vanished {
            return Err(self.not_found(name));
        }
        invocation.finish(vec![file], rows).await
    }

    /// Imports every blob under `prefix`. Per-blob extraction and
    /// configuration failures and vanished blobs are reported, not fatal.
    pub async fn process_all(&self, prefix: Option<&str>) -> Result<ImportReport> {
        let invocation = self.invocation();
        let cap = self.options.blob_concurrency.max(1);
        info!(
            pipeline = %self.pipeline.id,
            bucket = self.bucket.name(),
            prefix = prefix.unwrap_or(""),
            concurrency = cap,
            "starting batch import"
        );

        let listing = self
            .bucket
            .list_blobs(prefix)
            .map_err(ProcessingError::Storage)
            .map_ok(|blob| {
                let invocation = &invocation;
                async move { invocation.process_blob(&blob).await }
            })
            .try_buffer_unordered(cap)
            .try_collect::<Vec<_>>();
        let mut results = invocation.guard(listing).await??;

        results.sort_by(|(a, _), (b, _)| a.blob.cmp(&b.blob));
        let (files, rows): (Vec<FileReport>, Vec<Vec<Row>>) = results.into_iter().unzip();
        invocation
            .finish(files, rows.into_iter().flatten().collect())
            .await
    }

    /// Validates a storage-change notification and imports the object it
    /// names.
    pub async fn process_notification(
        &self,
        notification: &StorageNotification,
    ) -> Result<ImportReport> {
        let name = notification.validate(&self.pipeline.bucket_name)?;
        self.process_one(name).await
    }

    fn invocation(&self) -> Invocation<'_> {
        Invocation {
            ctx: self,
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            deadline: self.options.timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    fn not_found(&self, name: &str) -> ProcessingError {
        ProcessingError::NotFound {
            bucket: self.bucket.name().to_string(),
            name: name.to_string(),
        }
    }
}

/// One call of `process_one` or `process_all`.
struct Invocation<'a> {
    ctx: &'a ImportContext,
    id: Uuid,
    started_at: DateTime<Utc>,
    deadline: Option<Instant>,
}

impl Invocation<'_> {
    /// Runs `fut` unless the invocation is cancelled or out of time first.
    async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_| ProcessingError::DeadlineExceeded),
                None => Ok(fut.await),
            }
        };
        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => Err(ProcessingError::Cancelled),
            result = bounded => result,
        }
    }

    async fn process_blob(&self, blob: &Blob) -> Result<(FileReport, Vec<Row>)> {
        let pipeline = &self.ctx.pipeline;
        let name = blob.name();

        let needs_read = pipeline
            .rules
            .iter()
            .any(|rule| rule.matches(name) && needs_content(rule));
        let content = if needs_read {
            match self.guard(blob.open()).await? {
                Ok(bytes) => Some(bytes),
                Err(err) if err.is_not_found() => {
                    warn!(blob = name, "blob vanished before it could be read");
                    return Ok((FileReport::vanished(name), Vec::new()));
                }
                Err(err) => return Err(ProcessingError::Storage(err)),
            }
        } else {
            None
        };

        let table = self.ctx.table.as_ref();
        let outcomes: Vec<RuleOutcome> = self
            .guard(
                stream::iter(
                    pipeline
                        .rules
                        .iter()
                        .map(|rule| {
                            evaluate(rule, name, content.as_deref(), &pipeline.snippets, table)
                        })
                        .collect::<Vec<_>>(),
                )
                .buffered(self.ctx.options.rule_concurrency.max(1))
                .collect(),
            )
            .await?;

        let mut rows = Vec::new();
        let mut reports = Vec::with_capacity(outcomes.len());
        for (rule, outcome) in pipeline.rules.iter().zip(outcomes) {
            reports.push(RuleReport::from_outcome(&rule.name, &outcome));
            match outcome {
                RuleOutcome::Produced(row) => rows.push(row),
                RuleOutcome::Failed(failure) => warn!(
                    blob = name,
                    rule = %rule.name,
                    kind = ?failure.kind,
                    "rule failed: {}",
                    failure.message
                ),
                RuleOutcome::Skipped | RuleOutcome::NotApplicable => {}
            }
        }
        debug!(blob = name, rows = rows.len(), "evaluated blob");
        Ok((FileReport::from_rules(name, reports), rows))
    }

    async fn finish(&self, files: Vec<FileReport>, rows: Vec<Row>) -> Result<ImportReport> {
        let ctx = self.ctx;
        let table_name = ctx.table.table_ref().to_string();

        let inserted = if rows.is_empty() || ctx.options.dry_run {
            0
        } else {
            self.guard(ctx.table.insert_rows(&rows))
                .await?
                .map_err(|source| ProcessingError::Insert {
                    table: table_name.clone(),
                    source,
                })?
        };

        let summary = ImportSummary::from_files(&files);
        info!(
            invocation = %self.id,
            pipeline = %ctx.pipeline.id,
            files = summary.files,
            applied = summary.applied,
            skipped = summary.skipped,
            failed = summary.failed,
            inserted,
            dry_run = ctx.options.dry_run,
            "import finished"
        );

        Ok(ImportReport {
            invocation_id: self.id,
            pipeline: ctx.pipeline.id.clone(),
            bucket: ctx.bucket.name().to_string(),
            table: table_name,
            dry_run: ctx.options.dry_run,
            started_at: self.started_at,
            finished_at: Utc::now(),
            summary,
            rows,
            inserted,
            files,
        })
    }
}
