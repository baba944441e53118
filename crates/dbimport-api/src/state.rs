use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dbimport_bucket::StorageConfig;
use dbimport_processing::{ImportContext, ImportOptions};
use dbimport_table::PostgresTable;
use tracing::info;

const DEFAULT_CONFIG: &str = "config.yml";
const DEFAULT_STORAGE: &str = "s3";

/// Environment of the deployed function.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_file: PathBuf,
    pub pipeline: String,
    pub database_url: String,
    pub storage: StorageConfig,
    pub timeout: Option<Duration>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let config_file = std::env::var("DBIMPORT_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG.to_string())
            .into();
        let pipeline = std::env::var("DBIMPORT_PIPELINE").context("DBIMPORT_PIPELINE not set")?;
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let storage = std::env::var("DBIMPORT_STORAGE")
            .unwrap_or_else(|_| DEFAULT_STORAGE.to_string())
            .parse()
            .context("invalid DBIMPORT_STORAGE")?;
        let timeout = std::env::var("DBIMPORT_TIMEOUT_SECS")
            .ok()
            .map(|secs| secs.parse::<u64>().map(Duration::from_secs))
            .transpose()
            .context("invalid DBIMPORT_TIMEOUT_SECS")?;

        Ok(Self {
            config_file,
            pipeline,
            database_url,
            storage,
            timeout,
        })
    }
}

/// Handles shared by every request. Built once at startup.
#[derive(Clone)]
pub struct AppState {
    ctx: ImportContext,
}

impl AppState {
    pub fn new(ctx: ImportContext) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub async fn connect(settings: &Settings) -> Result<Arc<Self>> {
        let config = dbimport_config::load(&settings.config_file)
            .with_context(|| format!("loading {}", settings.config_file.display()))?;
        let pipeline = config.pipeline(&settings.pipeline)?.clone();
        let table_ref = pipeline.table_ref()?;

        let pool = PostgresTable::connect(&settings.database_url, 5).await?;
        let table = PostgresTable::open(pool, table_ref).await?;
        let storage = settings.storage.connect().await?;

        let ctx = ImportContext::for_pipeline(pipeline, storage.as_ref(), Arc::new(table))
            .await?
            .with_options(ImportOptions {
                timeout: settings.timeout,
                ..Default::default()
            });
        info!(
            pipeline = %ctx.pipeline().id,
            bucket = ctx.bucket().name(),
            table = %ctx.table().table_ref(),
            "import context ready"
        );
        Ok(Self::new(ctx))
    }

    /// A context for one request; cancelling the server cancels it too.
    pub fn request_context(&self) -> ImportContext {
        let token = self.ctx.cancellation().child_token();
        self.ctx.clone().with_cancellation(token)
    }

    pub fn context(&self) -> &ImportContext {
        &self.ctx
    }
}
