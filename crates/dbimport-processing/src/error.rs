use dbimport_bucket::BucketError;
use dbimport_config::ConfigError;
use dbimport_table::TableError;
use thiserror::Error;

/// Fatal failures of one import invocation. Per-rule and per-blob problems
/// are reported in [`crate::ImportReport`] instead.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("blob '{name}' does not exist in bucket '{bucket}'")]
    NotFound { bucket: String, name: String },

    #[error("storage error: {0}")]
    Storage(BucketError),

    #[error("insert into '{table}' failed: {source}")]
    Insert {
        table: String,
        #[source]
        source: TableError,
    },

    #[error("import was cancelled")]
    Cancelled,

    #[error("import deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Notification(#[from] NotificationError),
}

impl ProcessingError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProcessingError::NotFound { .. })
    }
}

/// A storage-change notification this entry point does not handle.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("malformed notification: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unexpected event type '{0}'")]
    UnexpectedType(String),

    #[error("notification carries no object name")]
    MissingName,

    #[error("notification is for bucket '{actual}', expected '{expected}'")]
    BucketMismatch { expected: String, actual: String },
}

/// A rule could not read the value it needs from the blob.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("parameter '{parameter}': {message}")]
pub struct ExtractionError {
    pub parameter: String,
    pub message: String,
}

impl ExtractionError {
    pub(crate) fn new(parameter: &str, message: impl Into<String>) -> Self {
        Self {
            parameter: parameter.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn content(message: impl Into<String>) -> Self {
        Self::new("<content>", message)
    }
}

pub type Result<T> = std::result::Result<T, ProcessingError>;
