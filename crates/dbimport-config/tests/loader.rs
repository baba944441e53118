use std::fs;
use std::path::{Path, PathBuf};

use dbimport_config::{load, load_str, ConfigError, ContentFormat, ParameterSource};
use dbimport_table::{ScalarType, TableRef};

fn data(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name)
}

#[test]
fn loads_pipelines_with_embedded_snippets() {
    let file = load(&data("config.yml")).expect("load config");

    assert_eq!(file.pipelines.len(), 2);
    let pipeline = file.pipeline("comparative_benchmark").unwrap();
    assert_eq!(pipeline.id, "comparative_benchmark");
    assert_eq!(pipeline.bucket_name, "comparative-benchmark-artifacts");
    assert_eq!(
        pipeline.table_ref().unwrap(),
        TableRef {
            project: Some("openxla-benchmarks".into()),
            dataset: Some("comparative".into()),
            table: "results".into(),
        }
    );
    assert_eq!(
        pipeline.snippets["latest_only"].trim(),
        "date = (SELECT MAX(date) FROM ${dataset}.${table})"
    );
    // Shared snippets are visible to every pipeline.
    assert!(pipeline.snippets.contains_key("same_commit"));
    assert!(file.pipeline("summaries").unwrap().snippets.contains_key("same_commit"));

    let rule = &pipeline.rules[0];
    assert_eq!(rule.format, ContentFormat::Json);
    assert!(rule.matches("2023-06-01/abc123/resnet50.json"));
    assert!(!rule.matches("2023-06-01/abc123/resnet50.csv"));
    let captures = rule.path_captures("2023-06-01/abc123/resnet50.json");
    assert_eq!(captures["git_commit"], "abc123");
    assert_eq!(captures["benchmark"], "resnet50");

    let latency = &rule.parameters["latency_ms"];
    assert!(matches!(&latency.source, ParameterSource::Json { pointer } if pointer == "/metrics/latency_ms"));
    assert_eq!(latency.effective_type(), Some(ScalarType::Float));
    assert_eq!(rule.parameters["device"].effective_type(), None);
    assert!(rule.parameters["device"].optional);
    assert!(rule.lint(&pipeline.snippets).is_empty());
}

#[test]
fn reloading_is_deterministic() {
    let first = load(&data("config.yml")).unwrap();
    let second = load(&data("config.yml")).unwrap();
    assert_eq!(
        serde_yaml::to_string(&first).unwrap(),
        serde_yaml::to_string(&second).unwrap()
    );
}

#[test]
fn embed_outside_config_directory_is_a_security_error() {
    let err = load(&data("escape.yml")).unwrap_err();
    assert!(err.is_security(), "unexpected error: {err}");
    assert!(err.to_string().starts_with("ConfigSecurityError"));
}

#[cfg(unix)]
#[test]
fn embed_through_symlink_out_of_tree_is_rejected() {
    let outside = tempfile::tempdir().unwrap();
    fs::write(outside.path().join("secret.txt"), "secret").unwrap();

    let config_dir = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink(
        outside.path().join("secret.txt"),
        config_dir.path().join("link.txt"),
    )
    .unwrap();

    let err = load_str("snippets:\n  s: !embed link.txt\npipelines: {}", config_dir.path()).unwrap_err();
    assert!(err.is_security());
}

#[test]
fn embed_of_absolute_path_out_of_tree_is_rejected() {
    let outside = tempfile::tempdir().unwrap();
    let secret = outside.path().join("secret.sql");
    fs::write(&secret, "SELECT 1").unwrap();

    let config_dir = tempfile::tempdir().unwrap();
    let doc = format!("snippets:\n  s: !embed {}\npipelines: {{}}", secret.display());
    let err = load_str(&doc, config_dir.path()).unwrap_err();
    assert!(err.is_security(), "unexpected error: {err}");
}

#[test]
fn missing_embed_target_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_str("snippets:\n  s: !embed nope.sql\npipelines: {}", dir.path()).unwrap_err();
    assert!(err.is_security());
}

#[test]
fn structural_errors_abort_loading() {
    let dir = tempfile::tempdir().unwrap();

    let both_matchers = r#"
pipelines:
  p:
    bucket_name: b
    table_name: t
    rules:
      - name: r
        filepath_regex: '.*'
        filepath_glob: '*'
"#;
    assert!(matches!(
        load_str(both_matchers, dir.path()),
        Err(ConfigError::InvalidRule { .. })
    ));

    let duplicate_rules = r#"
pipelines:
  p:
    bucket_name: b
    table_name: t
    rules:
      - { name: r, filepath_glob: '*' }
      - { name: r, filepath_glob: '*' }
"#;
    assert!(matches!(
        load_str(duplicate_rules, dir.path()),
        Err(ConfigError::InvalidPipeline { .. })
    ));

    let bad_regex = r#"
pipelines:
  p:
    bucket_name: b
    table_name: t
    rules:
      - { name: r, filepath_regex: '(' }
"#;
    assert!(matches!(load_str(bad_regex, dir.path()), Err(ConfigError::Parse(_))));

    let wrong_format = r#"
pipelines:
  p:
    bucket_name: b
    table_name: t
    rules:
      - name: r
        filepath_glob: '*'
        format: text
        parameters:
          id: { from: csv, column: id }
"#;
    assert!(matches!(
        load_str(wrong_format, dir.path()),
        Err(ConfigError::InvalidRule { .. })
    ));

    let bad_table = r#"
pipelines:
  p:
    bucket_name: b
    table_name: "a..b"
    rules: []
"#;
    assert!(matches!(
        load_str(bad_table, dir.path()),
        Err(ConfigError::InvalidPipeline { .. })
    ));
}

#[test]
fn lint_reports_undeclared_names() {
    let dir = tempfile::tempdir().unwrap();
    let doc = r#"
pipelines:
  p:
    bucket_name: b
    table_name: t
    rules:
      - name: r
        filepath_glob: '*.csv'
        format: csv
        parameters:
          id: { from: csv, column: id }
          when: { from: path, group: date }
        sql_condition: "SELECT 1 FROM t WHERE id = ${id} AND x = ${missing} AND ${snippets.nope}"
"#;
    let file = load_str(doc, dir.path()).unwrap();
    let pipeline = file.pipeline("p").unwrap();
    let issues = pipeline.rules[0].lint(&pipeline.snippets);
    assert_eq!(issues.len(), 3, "{issues:?}");
}

#[test]
fn unknown_pipeline_is_reported() {
    let file = load(&data("config.yml")).unwrap();
    assert!(matches!(
        file.pipeline("nope"),
        Err(ConfigError::UnknownPipeline(name)) if name == "nope"
    ));
    assert_eq!(file.select(&[]).unwrap().len(), 2);
}
