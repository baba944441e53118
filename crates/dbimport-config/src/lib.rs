//! Declarative import configuration: pipelines, rules, snippets and the
//! templates that tie them together.

pub mod document;
pub mod error;
pub mod pipeline;
pub mod template;

pub use document::{load, load_str};
pub use error::{ConfigError, Result};
pub use pipeline::{
    ConfigFile, ContentFormat, GlobPattern, ParameterSource, ParameterSpec, PatternRegex,
    PipelineConfig, RuleConfig, PIPELINES_KEY,
};
pub use template::{RenderContext, Segment, Template};
