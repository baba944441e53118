use std::collections::BTreeMap;

use anyhow::Result;
use clap::{Args, ValueEnum};
use dbimport_config::PipelineConfig;
use dbimport_processing::OBJECT_FINALIZED;
use serde::Serialize;

use super::{print_json, Workspace};

const FUNCTION_PREFIX: &str = "db-import-";

#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Pipeline ids; all pipelines when omitted.
    pub pipelines: Vec<String>,

    #[arg(long, default_value = "us-central1")]
    pub region: String,

    /// Container image serving the notification endpoint.
    #[arg(long, env = "DBIMPORT_IMAGE", default_value = "dbimport-api:latest")]
    pub image: String,

    #[arg(long, value_enum, default_value_t = PlanFormat::Yaml)]
    pub format: PlanFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlanFormat {
    Json,
    Yaml,
}

/// Everything a provisioning tool needs to stand up the notification
/// endpoint of one pipeline.
#[derive(Debug, Serialize)]
pub struct DeploymentPlan {
    pub function: String,
    pub region: String,
    pub image: String,
    pub trigger: Trigger,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct Trigger {
    pub event_type: &'static str,
    pub bucket: String,
}

pub fn plan(workspace: &Workspace, pipeline: &PipelineConfig, args: &DeployArgs) -> DeploymentPlan {
    let function = pipeline
        .cloud_function_name
        .clone()
        .unwrap_or_else(|| format!("{FUNCTION_PREFIX}{}", pipeline.id.replace('_', "-")));

    let config_name = workspace
        .config_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config.yml".to_string());

    let environment = BTreeMap::from([
        ("DBIMPORT_PIPELINE".to_string(), pipeline.id.clone()),
        ("DBIMPORT_CONFIG".to_string(), config_name),
        ("DBIMPORT_STORAGE".to_string(), "s3".to_string()),
    ]);

    DeploymentPlan {
        function,
        region: args.region.clone(),
        image: args.image.clone(),
        trigger: Trigger {
            event_type: OBJECT_FINALIZED,
            bucket: pipeline.bucket_name.clone(),
        },
        environment,
    }
}

pub fn run(workspace: &Workspace, args: DeployArgs) -> Result<()> {
    let plans: Vec<DeploymentPlan> = workspace
        .select(&args.pipelines)?
        .into_iter()
        .map(|pipeline| plan(workspace, pipeline, &args))
        .collect();

    match args.format {
        PlanFormat::Json => print_json(&plans)?,
        PlanFormat::Yaml => print!("{}", serde_yaml::to_string(&plans)?),
    }
    Ok(())
}
