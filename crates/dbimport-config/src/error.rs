use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration document: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A transclusion tried to leave the configuration directory or target
    /// something other than a regular file. The file is never read.
    #[error("ConfigSecurityError: cannot embed '{path}': {reason}")]
    Security { path: String, reason: String },

    #[error("unsupported tag '{0}', only !embed is recognised")]
    UnsupportedTag(String),

    #[error("!embed expects a file path string")]
    InvalidEmbed,

    #[error("unknown pipeline '{0}'")]
    UnknownPipeline(String),

    #[error("pipeline '{pipeline}': {message}")]
    InvalidPipeline { pipeline: String, message: String },

    #[error("pipeline '{pipeline}', rule '{rule}': {message}")]
    InvalidRule {
        pipeline: String,
        rule: String,
        message: String,
    },

    #[error("invalid template '{template}': {message}")]
    Template { template: String, message: String },

    #[error("template references unknown parameter '{0}'")]
    MissingParameter(String),

    #[error("template references unknown snippet '{0}'")]
    MissingSnippet(String),

    #[error("snippet '{0}' may not reference other snippets")]
    NestedSnippet(String),
}

impl ConfigError {
    pub fn is_security(&self) -> bool {
        matches!(self, ConfigError::Security { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
