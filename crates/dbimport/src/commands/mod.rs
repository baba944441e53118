pub mod config;
pub mod deploy;
pub mod download;
pub mod import;
pub mod verify;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use dbimport_bucket::StorageConfig;
use dbimport_config::{ConfigFile, PipelineConfig};
use dbimport_processing::{ImportContext, ImportOptions, ImportReport, RuleStatus};
use dbimport_table::PostgresTable;
use serde::Serialize;

const MAX_CONNECTIONS: u32 = 5;

/// The loaded configuration plus the connection settings shared by every
/// subcommand.
pub struct Workspace {
    pub config_path: PathBuf,
    pub config: ConfigFile,
    pub storage: StorageConfig,
    pub database_url: Option<String>,
}

impl Workspace {
    pub fn load(
        config_path: PathBuf,
        storage: StorageConfig,
        database_url: Option<String>,
    ) -> Result<Self> {
        let config = dbimport_config::load(&config_path)
            .with_context(|| format!("loading configuration {}", config_path.display()))?;
        Ok(Self {
            config_path,
            config,
            storage,
            database_url,
        })
    }

    pub fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or(Path::new("."))
    }

    pub fn pipeline(&self, id: &str) -> Result<&PipelineConfig> {
        Ok(self.config.pipeline(id)?)
    }

    pub fn select(&self, ids: &[String]) -> Result<Vec<&PipelineConfig>> {
        Ok(self.config.select(ids)?)
    }

    /// Fixture directory of a pipeline, relative paths resolved against the
    /// configuration document.
    pub fn test_data(&self, pipeline: &PipelineConfig) -> Option<PathBuf> {
        pipeline
            .test_data
            .as_ref()
            .map(|path| self.config_dir().join(path))
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("a database is required: pass --database-url or set DATABASE_URL")
    }

    pub async fn open_table(&self, pipeline: &PipelineConfig) -> Result<PostgresTable> {
        let pool = PostgresTable::connect(self.database_url()?, MAX_CONNECTIONS).await?;
        let table = PostgresTable::open(pool, pipeline.table_ref()?)
            .await
            .with_context(|| format!("opening table {}", pipeline.table_name))?;
        Ok(table)
    }

    pub async fn import_context(
        &self,
        pipeline: &PipelineConfig,
        options: ImportOptions,
    ) -> Result<ImportContext> {
        let table = Arc::new(self.open_table(pipeline).await?);
        let storage = self.storage.connect().await?;
        let ctx = ImportContext::for_pipeline(pipeline.clone(), storage.as_ref(), table)
            .await?
            .with_options(options);
        Ok(ctx)
    }
}

pub fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    table
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Per-file summary of an import.
pub fn print_report(report: &ImportReport) {
    let mut table = new_table(&["blob", "status", "rows", "applied", "skipped", "failed"]);
    for file in &report.files {
        let count = |status: RuleStatus| file.rules.iter().filter(|r| r.status == status).count();
        table.add_row(vec![
            file.blob.clone(),
            format!("{:?}", file.status).to_lowercase(),
            file.rows.to_string(),
            count(RuleStatus::Applied).to_string(),
            count(RuleStatus::Skipped).to_string(),
            count(RuleStatus::Failed).to_string(),
        ]);
    }
    println!("{table}");

    for (blob, rule, failure) in report.failures() {
        println!("  {blob} [{rule}] {:?}: {}", failure.kind, failure.message);
    }

    let summary = &report.summary;
    println!(
        "{} files, {} applied, {} skipped, {} failed, {} vanished; {} rows produced, {} inserted{}",
        summary.files,
        summary.applied,
        summary.skipped,
        summary.failed,
        summary.vanished,
        report.rows.len(),
        report.inserted,
        if report.dry_run { " (dry run)" } else { "" }
    );
}
