//! Rule evaluation and import execution: turns blobs of a bucket into rows
//! of a table, once per logical record.

pub mod engine;
pub mod error;
pub mod executor;
pub mod extract;
pub mod notification;
pub mod report;
pub mod verify;

pub use engine::{evaluate, FailureKind, RuleFailure, RuleOutcome};
pub use error::{ExtractionError, NotificationError, ProcessingError, Result};
pub use executor::{ImportContext, ImportOptions, DEFAULT_BLOB_CONCURRENCY};
pub use notification::{StorageNotification, OBJECT_FINALIZED};
pub use report::{FileReport, FileStatus, ImportReport, ImportSummary, RuleReport, RuleStatus};
pub use verify::{VerificationFixture, VerificationReport, VerifyError};
