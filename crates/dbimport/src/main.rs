use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dbimport_bucket::StorageConfig;
use tracing_subscriber::EnvFilter;

mod commands;
use commands::config::ConfigCommands;
use commands::deploy::DeployArgs;
use commands::download::DownloadArgs;
use commands::import::{BatchImportArgs, ProcessArgs};
use commands::verify::VerifyArgs;
use commands::Workspace;

/// Imports files from storage buckets into database tables, driven by a
/// declarative pipeline configuration.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Pipeline configuration document.
    #[arg(short = 'F', long, env = "DBIMPORT_CONFIG", default_value = "config.yml", global = true)]
    config_file: PathBuf,

    /// Storage backend: `s3` or `local:<dir>`.
    #[arg(long, env = "DBIMPORT_STORAGE", default_value = "s3", global = true)]
    storage: StorageConfig,

    /// Postgres connection string of the target tables.
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect and check the configuration document.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Render the deployment plan of the notification entry point per pipeline.
    Deploy(DeployArgs),
    /// Mirror a pipeline's bucket into a local directory.
    Download(DownloadArgs),
    /// Import every file of a pipeline's bucket.
    BatchImport(BatchImportArgs),
    /// Import a single file of a pipeline's bucket.
    Process(ProcessArgs),
    /// Replay fixture files through pipelines and compare the produced rows.
    Verify(VerifyArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let workspace = Workspace::load(cli.config_file, cli.storage, cli.database_url)?;

    match cli.command {
        Commands::Config { command } => commands::config::run(&workspace, command),
        Commands::Deploy(args) => commands::deploy::run(&workspace, args),
        Commands::Download(args) => commands::download::run(&workspace, args).await,
        Commands::BatchImport(args) => commands::import::batch_import(&workspace, args).await,
        Commands::Process(args) => commands::import::process(&workspace, args).await,
        Commands::Verify(args) => commands::verify::run(&workspace, args).await,
    }
}
