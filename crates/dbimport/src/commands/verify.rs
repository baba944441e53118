use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use dbimport_config::PipelineConfig;
use dbimport_processing::verify::{self, VerificationFixture, VerificationReport};
use dbimport_processing::ImportOptions;
use dbimport_table::MemoryTable;
use tracing::warn;

use super::{new_table, print_json, Workspace};

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Pipeline ids; every pipeline with `test_data` when omitted.
    pub pipelines: Vec<String>,

    /// Fixture directory, overriding the pipeline's `test_data`. Only valid
    /// with a single pipeline.
    #[arg(long)]
    pub fixture: Option<PathBuf>,

    #[arg(long)]
    pub json: bool,
}

pub async fn run(workspace: &Workspace, args: VerifyArgs) -> Result<()> {
    let explicit = !args.pipelines.is_empty();
    let pipelines = workspace.select(&args.pipelines)?;
    if args.fixture.is_some() && pipelines.len() != 1 {
        bail!("--fixture requires exactly one pipeline");
    }

    let mut reports = Vec::new();
    for pipeline in pipelines {
        let fixture_dir = match args.fixture.clone().or_else(|| workspace.test_data(pipeline)) {
            Some(dir) => dir,
            None if explicit => bail!("pipeline {} has no test_data", pipeline.id),
            None => continue,
        };
        let fixture = VerificationFixture::load(&fixture_dir)
            .with_context(|| format!("loading fixture for pipeline {}", pipeline.id))?;
        reports.push(verify_pipeline(workspace, pipeline, &fixture).await?);
    }

    if args.json {
        print_json(&reports)?;
    } else {
        print_reports(&reports);
    }

    let failed = reports.iter().filter(|report| !report.passed).count();
    if failed > 0 {
        bail!("{failed} of {} pipelines failed verification", reports.len());
    }
    Ok(())
}

/// Verifies against a scratch copy of the real table when a database is
/// configured, otherwise against an in-memory table.
async fn verify_pipeline(
    workspace: &Workspace,
    pipeline: &PipelineConfig,
    fixture: &VerificationFixture,
) -> Result<VerificationReport> {
    if workspace.database_url.is_none() {
        let table = Arc::new(MemoryTable::new(pipeline.table_ref()?));
        let report = verify::run(pipeline, fixture, table, ImportOptions::default()).await?;
        return Ok(report);
    }

    let target = workspace.open_table(pipeline).await?;
    let scratch = target.create_scratch_copy().await?;
    let result = verify::run(
        pipeline,
        fixture,
        Arc::new(scratch.clone()),
        ImportOptions::default(),
    )
    .await;
    if let Err(err) = scratch.drop_table().await {
        warn!(pipeline = %pipeline.id, "failed to drop scratch table: {err}");
    }
    Ok(result?)
}

fn print_reports(reports: &[VerificationReport]) {
    let mut table = new_table(&[
        "pipeline",
        "expected",
        "actual",
        "missing",
        "unexpected",
        "mismatched",
        "rerun inserted",
        "result",
    ]);
    for report in reports {
        table.add_row(vec![
            report.pipeline.clone(),
            report.expected.to_string(),
            report.actual.to_string(),
            report.missing.len().to_string(),
            report.unexpected.len().to_string(),
            report.mismatched.len().to_string(),
            report.rerun_inserted.to_string(),
            if report.passed { "pass" } else { "FAIL" }.to_string(),
        ]);
    }
    println!("{table}");

    for report in reports.iter().filter(|report| !report.passed) {
        println!("{}:", report.pipeline);
        for row in &report.missing {
            println!("  missing     {}", row.canonical());
        }
        for row in &report.unexpected {
            println!("  unexpected  {}", row.canonical());
        }
        for mismatch in &report.mismatched {
            println!(
                "  mismatched  {} != {}",
                mismatch.expected.canonical(),
                mismatch.actual.canonical()
            );
        }
        for (blob, rule, failure) in report.import.failures() {
            println!("  {blob} [{rule}] {:?}: {}", failure.kind, failure.message);
        }
    }
}
