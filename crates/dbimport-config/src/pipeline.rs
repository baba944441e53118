use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use dbimport_table::{Scalar, ScalarType, TableRef};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::template::{Template, RESERVED_NAMES};

pub const PIPELINES_KEY: &str = "pipelines";

/// The whole configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub pipelines: BTreeMap<String, PipelineConfig>,
    /// Snippets shared by every pipeline.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub snippets: BTreeMap<String, String>,
}

impl ConfigFile {
    pub fn pipeline(&self, id: &str) -> Result<&PipelineConfig> {
        self.pipelines
            .get(id)
            .ok_or_else(|| ConfigError::UnknownPipeline(id.to_string()))
    }

    /// Selected pipelines, or all of them when `ids` is empty.
    pub fn select(&self, ids: &[String]) -> Result<Vec<&PipelineConfig>> {
        if ids.is_empty() {
            return Ok(self.pipelines.values().collect());
        }
        ids.iter().map(|id| self.pipeline(id)).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Key of the pipeline in the document.
    #[serde(skip)]
    pub id: String,
    pub bucket_name: String,
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_function_name: Option<String>,
    /// Fixture directory for verification runs, relative to the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_data: Option<PathBuf>,
    /// Pipeline snippets. After loading, shared snippets are merged in
    /// underneath the pipeline's own.
    #[serde(default)]
    pub snippets: BTreeMap<String, String>,
    pub rules: Vec<RuleConfig>,
}

impl PipelineConfig {
    pub fn table_ref(&self) -> Result<TableRef> {
        self.table_name
            .parse()
            .map_err(|err: dbimport_table::TableError| ConfigError::InvalidPipeline {
                pipeline: self.id.clone(),
                message: err.to_string(),
            })
    }

    pub fn rule(&self, name: &str) -> Option<&RuleConfig> {
        self.rules.iter().find(|rule| rule.name == name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentFormat {
    Json,
    Csv,
    #[default]
    Text,
}

/// Declarative rule: which files it applies to, what it extracts, and how
/// duplicates are recognised.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath_regex: Option<PatternRegex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath_glob: Option<GlobPattern>,
    #[serde(default)]
    pub format: ContentFormat,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
    /// Presence check. A non-empty result means the record already exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_condition: Option<Template>,
    /// Output columns. Without it every parameter becomes a column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<BTreeMap<String, Template>>,
}

impl RuleConfig {
    pub fn matches(&self, blob_name: &str) -> bool {
        match (&self.filepath_regex, &self.filepath_glob) {
            (Some(regex), _) => regex.0.is_match(blob_name),
            (None, Some(glob)) => glob.0.matches(blob_name),
            (None, None) => false,
        }
    }

    /// Named capture groups of `filepath_regex`, empty for glob rules.
    pub fn path_captures(&self, blob_name: &str) -> BTreeMap<String, String> {
        let Some(PatternRegex(regex)) = &self.filepath_regex else {
            return BTreeMap::new();
        };
        let Some(captures) = regex.captures(blob_name) else {
            return BTreeMap::new();
        };
        regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.to_string(), m.as_str().to_string()))
            })
            .collect()
    }

    fn check_structure(&self, pipeline: &str) -> Result<()> {
        let invalid = |message: String| ConfigError::InvalidRule {
            pipeline: pipeline.to_string(),
            rule: self.name.clone(),
            message,
        };

        match (&self.filepath_regex, &self.filepath_glob) {
            (Some(_), Some(_)) => {
                return Err(invalid(
                    "filepath_regex and filepath_glob are mutually exclusive".into(),
                ))
            }
            (None, None) => {
                return Err(invalid(
                    "one of filepath_regex or filepath_glob is required".into(),
                ))
            }
            _ => {}
        }

        for (name, spec) in &self.parameters {
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(invalid(format!("parameter name '{name}' is reserved")));
            }
            let expected_format = match &spec.source {
                ParameterSource::Json { .. } => Some(ContentFormat::Json),
                ParameterSource::Csv { .. } => Some(ContentFormat::Csv),
                _ => None,
            };
            if let Some(expected) = expected_format {
                if expected != self.format {
                    return Err(invalid(format!(
                        "parameter '{name}' reads {expected:?} content but the rule format is {:?}",
                        self.format
                    )));
                }
            }
        }
        Ok(())
    }

    /// Static consistency checks beyond what loading enforces.
    pub fn lint(&self, snippets: &BTreeMap<String, String>) -> Vec<String> {
        let mut issues = Vec::new();
        let declared: BTreeSet<&str> = self.parameters.keys().map(String::as_str).collect();

        let mut templates: Vec<&Template> = self.sql_condition.iter().collect();
        if let Some(columns) = &self.columns {
            templates.extend(columns.values());
        }

        for template in templates {
            for name in template.parameters() {
                if !declared.contains(name) {
                    issues.push(format!("template uses undeclared parameter '{name}'"));
                }
            }
            for snippet in template.snippets() {
                match snippets.get(snippet).map(|text| Template::parse(text)) {
                    None => issues.push(format!("template uses unknown snippet '{snippet}'")),
                    Some(Err(err)) => issues.push(format!("snippet '{snippet}': {err}")),
                    Some(Ok(parsed)) => {
                        for name in parsed.parameters() {
                            if !declared.contains(name) {
                                issues.push(format!(
                                    "snippet '{snippet}' uses undeclared parameter '{name}'"
                                ));
                            }
                        }
                    }
                }
            }
        }

        for (name, spec) in &self.parameters {
            if let ParameterSource::Path { group } = &spec.source {
                let has_group = self
                    .filepath_regex
                    .as_ref()
                    .is_some_and(|regex| regex.0.capture_names().flatten().any(|g| g == group));
                if !has_group {
                    issues.push(format!(
                        "parameter '{name}' reads capture group '{group}' which filepath_regex does not define"
                    ));
                }
            }
        }

        issues
    }
}

/// How a parameter is obtained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(flatten)]
    pub source: ParameterSource,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ScalarType>,
    /// A missing value becomes null instead of an extraction error.
    #[serde(default)]
    pub optional: bool,
}

impl ParameterSpec {
    /// Declared type, or the source's natural one. `None` keeps the value
    /// as extracted (JSON values and literals); CSV cells are inferred; path
    /// and content captures are text.
    pub fn effective_type(&self) -> Option<ScalarType> {
        if self.kind.is_some() {
            return self.kind;
        }
        match self.source {
            ParameterSource::Json { .. } | ParameterSource::Literal { .. } => None,
            ParameterSource::Csv { .. } => Some(ScalarType::Auto),
            ParameterSource::Path { .. }
            | ParameterSource::BlobName
            | ParameterSource::Content { .. } => Some(ScalarType::String),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ParameterSource {
    /// Named capture group of the rule's `filepath_regex`.
    Path { group: String },
    BlobName,
    /// JSON pointer (RFC 6901) into the document.
    Json { pointer: String },
    /// Column of the first data record.
    Csv { column: String },
    /// Regex over the text content; `group` defaults to the whole match.
    Content {
        pattern: PatternRegex,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group: Option<String>,
    },
    Literal { value: Scalar },
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PatternRegex(pub Regex);

impl TryFrom<String> for PatternRegex {
    type Error = regex::Error;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Regex::new(&value).map(PatternRegex)
    }
}

impl From<PatternRegex> for String {
    fn from(value: PatternRegex) -> Self {
        value.0.as_str().to_string()
    }
}

impl fmt::Debug for PatternRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.0.as_str())
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GlobPattern(pub glob::Pattern);

impl TryFrom<String> for GlobPattern {
    type Error = glob::PatternError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        glob::Pattern::new(&value).map(GlobPattern)
    }
}

impl From<GlobPattern> for String {
    fn from(value: GlobPattern) -> Self {
        value.0.as_str().to_string()
    }
}

impl fmt::Debug for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "glob({})", self.0.as_str())
    }
}

/// Fills in pipeline ids, merges shared snippets and checks the structural
/// invariants every loaded document must satisfy.
pub(crate) fn finalize(mut file: ConfigFile) -> Result<ConfigFile> {
    for (id, pipeline) in file.pipelines.iter_mut() {
        pipeline.id = id.clone();

        for (name, text) in &file.snippets {
            pipeline
                .snippets
                .entry(name.clone())
                .or_insert_with(|| text.clone());
        }

        if pipeline.bucket_name.trim().is_empty() {
            return Err(ConfigError::InvalidPipeline {
                pipeline: id.clone(),
                message: "bucket_name must not be empty".into(),
            });
        }
        pipeline.table_ref()?;

        let mut names = BTreeSet::new();
        for rule in &pipeline.rules {
            if rule.name.trim().is_empty() || !names.insert(rule.name.as_str()) {
                return Err(ConfigError::InvalidPipeline {
                    pipeline: id.clone(),
                    message: format!("rule names must be unique and non-empty ('{}')", rule.name),
                });
            }
            rule.check_structure(id)?;
        }
    }
    Ok(file)
}
