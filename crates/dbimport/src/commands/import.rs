use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use dbimport_processing::{ImportContext, ImportOptions, ImportReport, DEFAULT_BLOB_CONCURRENCY};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{print_json, print_report, Workspace};

#[derive(Args, Debug)]
pub struct BatchImportArgs {
    pub pipeline: String,

    /// Only import blobs whose name starts with this prefix.
    #[arg(long)]
    pub prefix: Option<String>,

    /// Evaluate rules without inserting anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Blobs processed at the same time.
    #[arg(long, default_value_t = DEFAULT_BLOB_CONCURRENCY)]
    pub concurrency: usize,

    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Print the full report as JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ProcessArgs {
    pub pipeline: String,

    /// Name of the blob inside the pipeline's bucket.
    pub blob: String,

    #[arg(long)]
    pub dry_run: bool,

    #[arg(long)]
    pub timeout_secs: Option<u64>,

    #[arg(long)]
    pub json: bool,
}

pub async fn batch_import(workspace: &Workspace, args: BatchImportArgs) -> Result<()> {
    let pipeline = workspace.pipeline(&args.pipeline)?;
    let options = ImportOptions {
        blob_concurrency: args.concurrency.max(1),
        timeout: args.timeout_secs.map(Duration::from_secs),
        dry_run: args.dry_run,
        ..ImportOptions::default()
    };
    let ctx = interruptible(workspace.import_context(pipeline, options).await?);

    let report = ctx
        .process_all(args.prefix.as_deref())
        .await
        .with_context(|| format!("batch import of pipeline {}", pipeline.id))?;
    output(&report, args.json)
}

pub async fn process(workspace: &Workspace, args: ProcessArgs) -> Result<()> {
    let pipeline = workspace.pipeline(&args.pipeline)?;
    let options = ImportOptions {
        timeout: args.timeout_secs.map(Duration::from_secs),
        dry_run: args.dry_run,
        ..ImportOptions::default()
    };
    let ctx = interruptible(workspace.import_context(pipeline, options).await?);

    let report = ctx
        .process_one(&args.blob)
        .await
        .with_context(|| format!("processing {} with pipeline {}", args.blob, pipeline.id))?;
    output(&report, args.json)
}

/// Cancels the invocation on Ctrl-C.
fn interruptible(ctx: ImportContext) -> ImportContext {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling import");
            on_signal.cancel();
        }
    });
    ctx.with_cancellation(token)
}

fn output(report: &ImportReport, json: bool) -> Result<()> {
    if json {
        print_json(report)
    } else {
        print_report(report);
        Ok(())
    }
}
