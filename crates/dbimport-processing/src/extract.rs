//! Parameter extraction from blob names and content.

use std::collections::BTreeMap;

use dbimport_config::{ContentFormat, ParameterSource, ParameterSpec, RuleConfig};
use dbimport_table::Scalar;
use serde_json::Value;

use crate::error::ExtractionError;

/// Blob content decoded once per rule according to its declared format.
#[derive(Debug)]
pub enum Document {
    /// Only the blob name is needed.
    Unread,
    Text(String),
    Json { text: String, value: Value },
    Csv { text: String, first: Option<BTreeMap<String, String>> },
}

impl Document {
    pub fn parse(format: ContentFormat, bytes: &[u8]) -> Result<Self, ExtractionError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ExtractionError::content("content is not valid UTF-8"))?
            .to_string();

        match format {
            ContentFormat::Text => Ok(Document::Text(text)),
            ContentFormat::Json => {
                let value = serde_json::from_str(&text)
                    .map_err(|err| ExtractionError::content(format!("invalid JSON: {err}")))?;
                Ok(Document::Json { text, value })
            }
            ContentFormat::Csv => {
                let first = first_csv_record(&text)?;
                Ok(Document::Csv { text, first })
            }
        }
    }

    fn text(&self) -> Option<&str> {
        match self {
            Document::Unread => None,
            Document::Text(text) | Document::Json { text, .. } | Document::Csv { text, .. } => {
                Some(text)
            }
        }
    }
}

fn first_csv_record(text: &str) -> Result<Option<BTreeMap<String, String>>, ExtractionError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|err| ExtractionError::content(format!("invalid CSV header: {err}")))?
        .clone();

    match reader.records().next() {
        None => Ok(None),
        Some(Err(err)) => Err(ExtractionError::content(format!("invalid CSV record: {err}"))),
        Some(Ok(record)) => Ok(Some(
            headers
                .iter()
                .zip(record.iter())
                .map(|(header, cell)| (header.to_string(), cell.to_string()))
                .collect(),
        )),
    }
}

/// True when any parameter of the rule reads the blob's content.
pub fn needs_content(rule: &RuleConfig) -> bool {
    rule.parameters.values().any(|spec| {
        matches!(
            spec.source,
            ParameterSource::Json { .. } | ParameterSource::Csv { .. } | ParameterSource::Content { .. }
        )
    })
}

/// Extracts and coerces every declared parameter of `rule`.
pub fn extract_parameters(
    rule: &RuleConfig,
    blob_name: &str,
    document: &Document,
) -> Result<BTreeMap<String, Scalar>, ExtractionError> {
    let captures = rule.path_captures(blob_name);

    rule.parameters
        .iter()
        .map(|(name, spec)| {
            let value = match raw_value(name, spec, blob_name, &captures, document)? {
                Some(value) => value,
                None if spec.optional => Scalar::Null,
                None => return Err(ExtractionError::new(name, "value not found")),
            };
            let value = match spec.effective_type() {
                Some(kind) => value
                    .coerce(kind)
                    .map_err(|message| ExtractionError::new(name, message))?,
                None => value,
            };
            Ok((name.clone(), value))
        })
        .collect()
}

fn raw_value(
    name: &str,
    spec: &ParameterSpec,
    blob_name: &str,
    captures: &BTreeMap<String, String>,
    document: &Document,
) -> Result<Option<Scalar>, ExtractionError> {
    match &spec.source {
        ParameterSource::BlobName => Ok(Some(Scalar::Text(blob_name.to_string()))),
        ParameterSource::Literal { value } => Ok(Some(value.clone())),
        ParameterSource::Path { group } => Ok(captures.get(group).cloned().map(Scalar::Text)),
        ParameterSource::Json { pointer } => {
            let Document::Json { value, .. } = document else {
                return Err(ExtractionError::new(name, "content was not parsed as JSON"));
            };
            match value.pointer(pointer) {
                None => Ok(None),
                Some(found) => Scalar::from_json(found).map(Some).ok_or_else(|| {
                    ExtractionError::new(name, format!("'{pointer}' is not a scalar value"))
                }),
            }
        }
        ParameterSource::Csv { column } => {
            let Document::Csv { first, .. } = document else {
                return Err(ExtractionError::new(name, "content was not parsed as CSV"));
            };
            let Some(record) = first else {
                return Ok(None);
            };
            Ok(record.get(column).map(|cell| {
                if cell.is_empty() {
                    Scalar::Null
                } else {
                    Scalar::Text(cell.clone())
                }
            }))
        }
        ParameterSource::Content { pattern, group } => {
            let text = document
                .text()
                .ok_or_else(|| ExtractionError::new(name, "content was not read"))?;
            let Some(found) = pattern.0.captures(text) else {
                return Ok(None);
            };
            let matched = match group {
                Some(group) => found.name(group),
                None => found.get(0),
            };
            Ok(matched.map(|m| Scalar::Text(m.as_str().to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(yaml: &str) -> RuleConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn reads_json_pointers_with_declared_types() {
        let rule = rule(
            r#"
name: r
filepath_regex: '^runs/(?P<run>[0-9]+)\.json$'
format: json
parameters:
  run: { from: path, group: run, type: integer }
  latency: { from: json, pointer: /metrics/latency, type: float }
  device: { from: json, pointer: /device }
  note: { from: json, pointer: /note, optional: true }
  source: { from: blob_name }
  kind: { from: literal, value: nightly }
"#,
        );
        let doc = Document::parse(
            ContentFormat::Json,
            br#"{"metrics": {"latency": 12}, "device": "gpu"}"#,
        )
        .unwrap();

        let params = extract_parameters(&rule, "runs/42.json", &doc).unwrap();
        assert_eq!(params["run"], Scalar::Int(42));
        assert_eq!(params["latency"], Scalar::Float(12.0));
        assert_eq!(params["device"], Scalar::Text("gpu".into()));
        assert_eq!(params["note"], Scalar::Null);
        assert_eq!(params["source"], Scalar::Text("runs/42.json".into()));
        assert_eq!(params["kind"], Scalar::Text("nightly".into()));
    }

    #[test]
    fn missing_required_values_fail() {
        let rule = rule(
            r#"
name: r
filepath_glob: '*.json'
format: json
parameters:
  device: { from: json, pointer: /device }
"#,
        );
        let doc = Document::parse(ContentFormat::Json, b"{}").unwrap();
        let err = extract_parameters(&rule, "a.json", &doc).unwrap_err();
        assert_eq!(err.parameter, "device");
    }

    #[test]
    fn csv_reads_first_record_and_infers_types() {
        let rule = rule(
            r#"
name: r
filepath_glob: '*.csv'
format: csv
parameters:
  id: { from: csv, column: id }
  name: { from: csv, column: name }
  score: { from: csv, column: score, optional: true }
"#,
        );
        let doc = Document::parse(ContentFormat::Csv, b"id,name,score\n7, seven ,\n8,eight,1\n").unwrap();
        let params = extract_parameters(&rule, "a.csv", &doc).unwrap();
        assert_eq!(params["id"], Scalar::Int(7));
        assert_eq!(params["name"], Scalar::Text("seven".into()));
        assert_eq!(params["score"], Scalar::Null);

        let empty = Document::parse(ContentFormat::Csv, b"id,name,score\n").unwrap();
        assert!(extract_parameters(&rule, "a.csv", &empty).is_err());
    }

    #[test]
    fn content_patterns_capture_groups() {
        let rule = rule(
            r#"
name: r
filepath_glob: '*.log'
parameters:
  version: { from: content, pattern: 'version: (?P<v>\S+)', group: v }
  banner: { from: content, pattern: 'BUILD OK' }
"#,
        );
        let doc = Document::parse(ContentFormat::Text, b"BUILD OK\nversion: 1.2.3\n").unwrap();
        let params = extract_parameters(&rule, "a.log", &doc).unwrap();
        assert_eq!(params["version"], Scalar::Text("1.2.3".into()));
        assert_eq!(params["banner"], Scalar::Text("BUILD OK".into()));
    }

    #[test]
    fn malformed_content_is_an_extraction_error() {
        assert!(Document::parse(ContentFormat::Json, b"{not json").is_err());
        assert!(Document::parse(ContentFormat::Text, &[0xff, 0xfe]).is_err());
    }

    #[test]
    fn coercion_failures_name_the_parameter() {
        let rule = rule(
            r#"
name: r
filepath_glob: '*.json'
format: json
parameters:
  count: { from: json, pointer: /count, type: integer }
"#,
        );
        let doc = Document::parse(ContentFormat::Json, br#"{"count": "many"}"#).unwrap();
        let err = extract_parameters(&rule, "a.json", &doc).unwrap_err();
        assert_eq!(err.parameter, "count");
    }
}
