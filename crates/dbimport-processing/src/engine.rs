//! Evaluation of one rule against one blob.
//!
//! A rule is plain data; this module is its only interpreter. Evaluation is
//! stateless: the presence check runs fresh every time, so two blobs carrying
//! the same logical key are checked independently.

use std::collections::BTreeMap;

use dbimport_config::{RenderContext, RuleConfig};
use dbimport_table::{Row, Scalar, TableStore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::extract::{extract_parameters, needs_content, Document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The blob's content could not be read as the rule expects.
    Extraction,
    /// A template names a parameter or snippet that does not exist.
    Config,
    /// The table store rejected the presence-check query.
    PresenceCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    NotApplicable,
    /// The presence check found the record.
    Skipped,
    Produced(Row),
    Failed(RuleFailure),
}

impl RuleOutcome {
    fn failed(kind: FailureKind, message: impl ToString) -> Self {
        RuleOutcome::Failed(RuleFailure {
            kind,
            message: message.to_string(),
        })
    }
}

/// Evaluates `rule` for the blob `blob_name`. `content` is `None` when the
/// blob was not read.
pub async fn evaluate(
    rule: &RuleConfig,
    blob_name: &str,
    content: Option<&[u8]>,
    snippets: &BTreeMap<String, String>,
    table: &dyn TableStore,
) -> RuleOutcome {
    if !rule.matches(blob_name) {
        return RuleOutcome::NotApplicable;
    }

    let document = match content {
        Some(bytes) if needs_content(rule) => match Document::parse(rule.format, bytes) {
            Ok(document) => document,
            Err(err) => return RuleOutcome::failed(FailureKind::Extraction, err),
        },
        _ => Document::Unread,
    };

    let params = match extract_parameters(rule, blob_name, &document) {
        Ok(params) => params,
        Err(err) => return RuleOutcome::failed(FailureKind::Extraction, err),
    };

    let ctx = RenderContext {
        params: &params,
        snippets,
        table: table.table_ref(),
    };

    if let Some(condition) = &rule.sql_condition {
        let query = match condition.render_query(&ctx) {
            Ok(query) => query,
            Err(err) => return RuleOutcome::failed(FailureKind::Config, err),
        };
        match table.presence_check(&query).await {
            Ok(true) => {
                debug!(rule = %rule.name, blob = blob_name, "record already present");
                return RuleOutcome::Skipped;
            }
            Ok(false) => {}
            Err(err) => return RuleOutcome::failed(FailureKind::PresenceCheck, err),
        }
    }

    match build_row(rule, &ctx) {
        Ok(row) => RuleOutcome::Produced(row),
        Err(err) => RuleOutcome::failed(FailureKind::Config, err),
    }
}

/// Renders the rule's columns, or copies every parameter when none are
/// declared.
pub fn build_row(rule: &RuleConfig, ctx: &RenderContext<'_>) -> dbimport_config::Result<Row> {
    match &rule.columns {
        None => Ok(ctx
            .params
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()),
        Some(columns) => columns
            .iter()
            .map(|(column, template)| Ok((column.clone(), template.render_value(ctx)?)))
            .collect::<dbimport_config::Result<BTreeMap<String, Scalar>>>()
            .map(Row::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbimport_table::{MemoryTable, TableRef};

    fn rule(yaml: &str) -> RuleConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn csv_rule() -> RuleConfig {
        rule(
            r#"
name: ids
filepath_glob: '*.csv'
format: csv
parameters:
  id: { from: csv, column: id }
sql_condition: "SELECT 1 FROM t WHERE id = ${id}"
"#,
        )
    }

    fn table() -> MemoryTable {
        MemoryTable::new(TableRef::new(None, "t"))
    }

    #[tokio::test]
    async fn non_matching_blobs_are_not_applicable() {
        let outcome = evaluate(&csv_rule(), "a.json", Some(b"{}"), &BTreeMap::new(), &table()).await;
        assert_eq!(outcome, RuleOutcome::NotApplicable);
    }

    #[tokio::test]
    async fn produces_a_row_then_skips_once_present() {
        let table = table();
        let rule = csv_rule();
        let snippets = BTreeMap::new();

        let outcome = evaluate(&rule, "a.csv", Some(b"id\n7\n"), &snippets, &table).await;
        let RuleOutcome::Produced(row) = outcome.clone() else {
            panic!("expected a row, got {outcome:?}");
        };
        assert_eq!(row.get("id"), Some(&Scalar::Int(7)));

        table.insert_rows(&[row]).await.unwrap();
        let again = evaluate(&rule, "a.csv", Some(b"id\n7\n"), &snippets, &table).await;
        assert_eq!(again, RuleOutcome::Skipped);
    }

    #[tokio::test]
    async fn missing_snippets_fail_the_rule_as_config_errors() {
        let rule = rule(
            r#"
name: r
filepath_glob: '*.csv'
format: csv
parameters:
  id: { from: csv, column: id }
sql_condition: "SELECT 1 FROM t WHERE ${snippets.by_id}"
"#,
        );
        let outcome = evaluate(&rule, "a.csv", Some(b"id\n1\n"), &BTreeMap::new(), &table()).await;
        assert!(matches!(outcome, RuleOutcome::Failed(RuleFailure { kind: FailureKind::Config, .. })));
    }

    #[tokio::test]
    async fn columns_render_templates() {
        let rule = rule(
            r#"
name: r
filepath_regex: '^(?P<day>[0-9-]+)/'
parameters:
  day: { from: path, group: day }
  name: { from: blob_name }
columns:
  day: "${day}"
  origin: "${table}:${name}"
"#,
        );
        let outcome = evaluate(&rule, "2024-01-01/x.txt", None, &BTreeMap::new(), &table()).await;
        let RuleOutcome::Produced(row) = outcome.clone() else {
            panic!("expected a row, got {outcome:?}");
        };
        assert_eq!(row.get("day"), Some(&Scalar::Text("2024-01-01".into())));
        assert_eq!(row.get("origin"), Some(&Scalar::Text("t:2024-01-01/x.txt".into())));
        assert_eq!(row.len(), 2);
    }

    #[tokio::test]
    async fn malformed_content_is_reported_as_extraction_failure() {
        let outcome = evaluate(&csv_rule(), "a.csv", Some(b"id\n1,2\n"), &BTreeMap::new(), &table()).await;
        assert!(matches!(
            outcome,
            RuleOutcome::Failed(RuleFailure { kind: FailureKind::Extraction, .. })
        ));
    }
}
