use std::collections::BTreeMap;

use anyhow::{bail, Result};
use clap::Subcommand;
use dbimport_config::ConfigFile;

use super::{new_table, Workspace};

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// List the configured pipelines.
    List,
    /// Print the selected pipelines with every `!embed` resolved.
    Dump {
        /// Pipeline ids; all pipelines when omitted.
        pipelines: Vec<String>,
    },
    /// Check every rule for undeclared parameters, unknown snippets and
    /// missing capture groups.
    Validate,
}

pub fn run(workspace: &Workspace, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::List => list(workspace),
        ConfigCommands::Dump { pipelines } => dump(workspace, &pipelines),
        ConfigCommands::Validate => validate(workspace),
    }
}

fn list(workspace: &Workspace) -> Result<()> {
    let mut table = new_table(&["pipeline", "bucket", "table", "rules", "function"]);
    for pipeline in workspace.config.pipelines.values() {
        table.add_row(vec![
            pipeline.id.clone(),
            pipeline.bucket_name.clone(),
            pipeline.table_name.clone(),
            pipeline.rules.len().to_string(),
            pipeline.cloud_function_name.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn dump(workspace: &Workspace, ids: &[String]) -> Result<()> {
    let pipelines: BTreeMap<String, _> = workspace
        .select(ids)?
        .into_iter()
        .map(|pipeline| (pipeline.id.clone(), pipeline.clone()))
        .collect();
    let selected = ConfigFile {
        pipelines,
        snippets: workspace.config.snippets.clone(),
    };
    print!("{}", serde_yaml::to_string(&selected)?);
    Ok(())
}

/// Every lint issue of the document as `(pipeline, rule, issue)`.
fn issues(config: &ConfigFile) -> Vec<(String, String, String)> {
    let mut found = Vec::new();
    for pipeline in config.pipelines.values() {
        for rule in &pipeline.rules {
            for issue in rule.lint(&pipeline.snippets) {
                found.push((pipeline.id.clone(), rule.name.clone(), issue));
            }
        }
    }
    found
}

fn validate(workspace: &Workspace) -> Result<()> {
    let found = issues(&workspace.config);
    if found.is_empty() {
        println!(
            "{}: {} pipelines ok",
            workspace.config_path.display(),
            workspace.config.pipelines.len()
        );
        return Ok(());
    }

    let mut table = new_table(&["pipeline", "rule", "issue"]);
    for (pipeline, rule, issue) in &found {
        table.add_row(vec![pipeline, rule, issue]);
    }
    println!("{table}");
    bail!("{} configuration issues", found.len())
}
