//! YAML loading with the `!embed` transclusion tag.
//!
//! ```yaml
//! snippets:
//!   latest_run: !embed queries/latest_run.sql
//! ```
//!
//! The tagged scalar is a path relative to the document's directory (absolute
//! paths are accepted when they point below that directory). The node is
//! replaced by the file's text. Targets outside the directory tree, or that
//! are not regular files, are rejected before anything is read.

use std::path::{Path, PathBuf};

use serde_yaml::Value;
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::pipeline::{finalize, ConfigFile};

const EMBED_TAG: &str = "!embed";

/// Loads the document at `path`; embeds resolve against its directory.
pub fn load(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let absolute = path.canonicalize().map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = absolute.parent().unwrap_or(Path::new("/"));
    load_str(&contents, base_dir)
}

/// Parses a document whose embeds resolve against `base_dir`.
pub fn load_str(contents: &str, base_dir: &Path) -> Result<ConfigFile> {
    let base_dir = base_dir.canonicalize().map_err(|source| ConfigError::Read {
        path: base_dir.to_path_buf(),
        source,
    })?;
    let raw: Value = serde_yaml::from_str(contents)?;
    let resolved = resolve_embeds(raw, &base_dir)?;
    let file: ConfigFile = serde_yaml::from_value(resolved)?;
    finalize(file)
}

fn resolve_embeds(value: Value, base_dir: &Path) -> Result<Value> {
    match value {
        Value::Tagged(tagged) => {
            if tagged.tag != EMBED_TAG {
                return Err(ConfigError::UnsupportedTag(tagged.tag.to_string()));
            }
            match tagged.value {
                Value::String(path) => Ok(Value::String(embed(&path, base_dir)?)),
                _ => Err(ConfigError::InvalidEmbed),
            }
        }
        Value::Mapping(mapping) => mapping
            .into_iter()
            .map(|(key, value)| Ok((key, resolve_embeds(value, base_dir)?)))
            .collect::<Result<serde_yaml::Mapping>>()
            .map(Value::Mapping),
        Value::Sequence(items) => items
            .into_iter()
            .map(|item| resolve_embeds(item, base_dir))
            .collect::<Result<Vec<_>>>()
            .map(Value::Sequence),
        other => Ok(other),
    }
}

/// Resolves `requested` inside `base_dir` (already canonical) and reads it.
fn embed(requested: &str, base_dir: &Path) -> Result<String> {
    let rejected = |reason: &str| ConfigError::Security {
        path: requested.to_string(),
        reason: reason.to_string(),
    };

    let candidate = Path::new(requested);
    let candidate: PathBuf = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_dir.join(candidate)
    };

    // Symlinks and `..` are resolved before the containment check.
    let resolved = candidate
        .canonicalize()
        .map_err(|_| rejected("target is not a regular file"))?;
    if !resolved.starts_with(base_dir) {
        return Err(rejected("path resolves outside the configuration directory"));
    }
    let metadata = std::fs::metadata(&resolved).map_err(|_| rejected("target is not a regular file"))?;
    if !metadata.is_file() {
        return Err(rejected("target is not a regular file"));
    }

    debug!(path = %resolved.display(), "embedding file into configuration");
    std::fs::read_to_string(&resolved).map_err(|source| ConfigError::Read {
        path: resolved,
        source,
    })
}
