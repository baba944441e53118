use chrono::{DateTime, Utc};
use dbimport_table::Row;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::{FailureKind, RuleFailure, RuleOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Applied,
    Skipped,
    NotApplicable,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleReport {
    pub rule: String,
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RuleFailure>,
}

impl RuleReport {
    pub(crate) fn from_outcome(rule: &str, outcome: &RuleOutcome) -> Self {
        let (status, failure) = match outcome {
            RuleOutcome::NotApplicable => (RuleStatus::NotApplicable, None),
            RuleOutcome::Skipped => (RuleStatus::Skipped, None),
            RuleOutcome::Produced(_) => (RuleStatus::Applied, None),
            RuleOutcome::Failed(failure) => (RuleStatus::Failed, Some(failure.clone())),
        };
        Self {
            rule: rule.to_string(),
            status,
            failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// At least one rule produced a row.
    Imported,
    /// Every matching rule found its record already present.
    Skipped,
    /// No rule matched the blob.
    Ignored,
    /// At least one rule failed.
    Failed,
    /// The blob disappeared between listing and reading.
    Vanished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub blob: String,
    pub status: FileStatus,
    pub rows: usize,
    pub rules: Vec<RuleReport>,
}

impl FileReport {
    pub(crate) fn from_rules(blob: &str, rules: Vec<RuleReport>) -> Self {
        let count = |status| rules.iter().filter(|r| r.status == status).count();
        let rows = count(RuleStatus::Applied);
        let status = if count(RuleStatus::Failed) > 0 {
            FileStatus::Failed
        } else if rows > 0 {
            FileStatus::Imported
        } else if count(RuleStatus::Skipped) > 0 {
            FileStatus::Skipped
        } else {
            FileStatus::Ignored
        };
        Self {
            blob: blob.to_string(),
            status,
            rows,
            rules,
        }
    }

    pub(crate) fn vanished(blob: &str) -> Self {
        Self {
            blob: blob.to_string(),
            status: FileStatus::Vanished,
            rows: 0,
            rules: Vec::new(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &RuleFailure)> {
        self.rules
            .iter()
            .filter_map(|r| r.failure.as_ref().map(|f| (r.rule.as_str(), f)))
    }
}

/// Rule outcome counts across every file of an invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub files: usize,
    pub applied: usize,
    pub skipped: usize,
    pub not_applicable: usize,
    pub failed: usize,
    pub vanished: usize,
}

impl ImportSummary {
    pub fn from_files(files: &[FileReport]) -> Self {
        let mut summary = ImportSummary {
            files: files.len(),
            ..Default::default()
        };
        for file in files {
            if file.status == FileStatus::Vanished {
                summary.vanished += 1;
            }
            for rule in &file.rules {
                match rule.status {
                    RuleStatus::Applied => summary.applied += 1,
                    RuleStatus::Skipped => summary.skipped += 1,
                    RuleStatus::NotApplicable => summary.not_applicable += 1,
                    RuleStatus::Failed => summary.failed += 1,
                }
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportReport {
    pub invocation_id: Uuid,
    pub pipeline: String,
    pub bucket: String,
    pub table: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: ImportSummary,
    /// Rows handed to the table store, in blob then rule order.
    pub rows: Vec<Row>,
    /// Rows the table store actually stored; `0` for dry runs.
    pub inserted: u64,
    pub files: Vec<FileReport>,
}

impl ImportReport {
    /// Every rule failure of the invocation, with its blob and rule names.
    pub fn failures(&self) -> Vec<(&str, &str, &RuleFailure)> {
        self.files
            .iter()
            .flat_map(|file| {
                file.failures()
                    .map(move |(rule, failure)| (file.blob.as_str(), rule, failure))
            })
            .collect()
    }

    pub fn failures_of(&self, kind: FailureKind) -> usize {
        self.failures()
            .into_iter()
            .filter(|(_, _, failure)| failure.kind == kind)
            .count()
    }

    pub fn file(&self, blob: &str) -> Option<&FileReport> {
        self.files.iter().find(|file| file.blob == blob)
    }
}
