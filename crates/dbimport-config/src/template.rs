//! `${...}` templates used by presence checks and row columns.
//!
//! | placeholder | expands to |
//! |---|---|
//! | `${name}` | extracted parameter `name` (a bind parameter in queries) |
//! | `${snippets.name}` | snippet text, itself a template without snippets |
//! | `${project}`, `${dataset}`, `${table}` | parts of the target table name |
//!
//! `$$` produces a literal `$`; a `$` not followed by `{` is kept as is.

use std::collections::BTreeMap;
use std::fmt;

use dbimport_table::{RenderedQuery, Scalar, TableRef};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

const SNIPPET_PREFIX: &str = "snippets.";

pub const RESERVED_NAMES: [&str; 3] = ["project", "dataset", "table"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
    Snippet(String),
    Project,
    Dataset,
    Table,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

/// Values available while rendering.
pub struct RenderContext<'a> {
    pub params: &'a BTreeMap<String, Scalar>,
    pub snippets: &'a BTreeMap<String, String>,
    pub table: &'a TableRef,
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        let error = |message: String| ConfigError::Template {
            template: source.to_string(),
            message,
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(at) = rest.find('$') {
            literal.push_str(&rest[..at]);
            let after = &rest[at + 1..];
            if let Some(stripped) = after.strip_prefix('$') {
                literal.push('$');
                rest = stripped;
            } else if let Some(body) = after.strip_prefix('{') {
                let end = body
                    .find('}')
                    .ok_or_else(|| error("unterminated '${'".to_string()))?;
                let name = body[..end].trim();
                let segment = match name {
                    "project" => Segment::Project,
                    "dataset" => Segment::Dataset,
                    "table" => Segment::Table,
                    _ => match name.strip_prefix(SNIPPET_PREFIX) {
                        Some(snippet) if valid_name(snippet) => Segment::Snippet(snippet.to_string()),
                        _ if valid_name(name) => Segment::Param(name.to_string()),
                        _ => return Err(error(format!("invalid placeholder '${{{name}}}'"))),
                    },
                };
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(segment);
                rest = &body[end + 1..];
            } else {
                literal.push('$');
                rest = after;
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Parameter names referenced directly (not through snippets).
    pub fn parameters(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Param(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn snippets(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Snippet(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Renders into SQL with positional bind parameters. Each distinct
    /// parameter is bound once, in order of first use.
    pub fn render_query(&self, ctx: &RenderContext<'_>) -> Result<RenderedQuery> {
        let mut query = QueryBuilder::default();
        self.render_into(ctx, &mut query, true)?;
        Ok(RenderedQuery {
            sql: query.sql,
            params: query.params,
        })
    }

    /// Renders a column value. A template consisting of exactly one
    /// parameter keeps the parameter's type; anything else becomes text.
    pub fn render_value(&self, ctx: &RenderContext<'_>) -> Result<Scalar> {
        if let [Segment::Param(name)] = self.segments.as_slice() {
            return ctx
                .params
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::MissingParameter(name.clone()));
        }
        let mut text = String::new();
        self.render_text_into(ctx, &mut text, true)?;
        Ok(Scalar::Text(text))
    }

    fn render_into(
        &self,
        ctx: &RenderContext<'_>,
        query: &mut QueryBuilder,
        allow_snippets: bool,
    ) -> Result<()> {
        for segment in &self.segments {
            match segment {
                Segment::Param(name) => {
                    let value = ctx
                        .params
                        .get(name)
                        .ok_or_else(|| ConfigError::MissingParameter(name.clone()))?;
                    query.bind(name, value);
                }
                Segment::Snippet(name) => {
                    let nested = snippet(ctx, name, allow_snippets)?;
                    nested.render_into(ctx, query, false)?;
                }
                other => query.sql.push_str(&fixed_text(ctx, other)?),
            }
        }
        Ok(())
    }

    fn render_text_into(
        &self,
        ctx: &RenderContext<'_>,
        out: &mut String,
        allow_snippets: bool,
    ) -> Result<()> {
        for segment in &self.segments {
            match segment {
                Segment::Param(name) => {
                    let value = ctx
                        .params
                        .get(name)
                        .ok_or_else(|| ConfigError::MissingParameter(name.clone()))?;
                    out.push_str(&value.to_string());
                }
                Segment::Snippet(name) => {
                    let nested = snippet(ctx, name, allow_snippets)?;
                    nested.render_text_into(ctx, out, false)?;
                }
                other => out.push_str(&fixed_text(ctx, other)?),
            }
        }
        Ok(())
    }
}

fn snippet(ctx: &RenderContext<'_>, name: &str, allow: bool) -> Result<Template> {
    if !allow {
        return Err(ConfigError::NestedSnippet(name.to_string()));
    }
    let text = ctx
        .snippets
        .get(name)
        .ok_or_else(|| ConfigError::MissingSnippet(name.to_string()))?;
    Template::parse(text)
}

fn fixed_text(ctx: &RenderContext<'_>, segment: &Segment) -> Result<String> {
    match segment {
        Segment::Literal(text) => Ok(text.clone()),
        Segment::Table => Ok(ctx.table.table.clone()),
        Segment::Dataset => ctx
            .table
            .dataset
            .clone()
            .ok_or_else(|| ConfigError::MissingParameter("dataset".into())),
        Segment::Project => ctx
            .table
            .project
            .clone()
            .ok_or_else(|| ConfigError::MissingParameter("project".into())),
        Segment::Param(name) => Err(ConfigError::MissingParameter(name.clone())),
        Segment::Snippet(name) => Err(ConfigError::MissingSnippet(name.clone())),
    }
}

#[derive(Default)]
struct QueryBuilder {
    sql: String,
    params: Vec<Scalar>,
    bound: Vec<String>,
}

impl QueryBuilder {
    fn bind(&mut self, name: &str, value: &Scalar) {
        let index = match self.bound.iter().position(|bound| bound == name) {
            Some(existing) => existing + 1,
            None => {
                self.bound.push(name.to_string());
                self.params.push(value.clone());
                self.params.len()
            }
        };
        self.sql.push('$');
        self.sql.push_str(&index.to_string());
    }
}

impl TryFrom<String> for Template {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        Template::parse(&value)
    }
}

impl From<Template> for String {
    fn from(value: Template) -> Self {
        value.source
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Template").field(&self.source).finish()
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
