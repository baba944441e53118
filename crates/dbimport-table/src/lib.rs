//! Target-table access for imports: the row model, the [`TableStore`] seam and
//! its Postgres and in-memory implementations.

mod memory;
mod postgres;
mod row;

pub use memory::MemoryTable;
pub use postgres::PostgresTable;
pub use row::{Row, Scalar, ScalarType};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid table name '{0}', expected [project.]dataset.table or table")]
    InvalidTableName(String),

    #[error("table '{0}' does not exist")]
    TableNotFound(String),

    #[error("rows for '{table}' carry columns unknown to the table: {}", .columns.join(", "))]
    SchemaMismatch { table: String, columns: Vec<String> },

    #[error("unsupported presence-check query: {0}")]
    UnsupportedQuery(String),

    #[error("query references bind parameter ${0} but only {1} were supplied")]
    MissingBindParameter(usize, usize),
}

/// Fully qualified table identifier, e.g. `project.dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub project: Option<String>,
    pub dataset: Option<String>,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: Option<&str>, table: &str) -> Self {
        Self {
            project: None,
            dataset: dataset.map(str::to_string),
            table: table.to_string(),
        }
    }

    pub fn dataset_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.dataset.as_deref().unwrap_or(default)
    }

    /// Same project and dataset, different table.
    pub fn sibling(&self, table: &str) -> Self {
        Self {
            project: self.project.clone(),
            dataset: self.dataset.clone(),
            table: table.to_string(),
        }
    }
}

impl FromStr for TableRef {
    type Err = TableError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split('.').collect();
        if parts.iter().any(|part| part.trim().is_empty()) {
            return Err(TableError::InvalidTableName(value.to_string()));
        }
        match parts.as_slice() {
            [table] => Ok(TableRef::new(None, table)),
            [dataset, table] => Ok(TableRef::new(Some(dataset), table)),
            [project, dataset, table] => Ok(TableRef {
                project: Some(project.to_string()),
                dataset: Some(dataset.to_string()),
                table: table.to_string(),
            }),
            _ => Err(TableError::InvalidTableName(value.to_string())),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(project) = &self.project {
            write!(f, "{project}.")?;
        }
        if let Some(dataset) = &self.dataset {
            write!(f, "{dataset}.")?;
        }
        f.write_str(&self.table)
    }
}

/// A presence-check query with positional bind parameters (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<Scalar>,
}

#[async_trait]
pub trait TableStore: Send + Sync {
    fn table_ref(&self) -> &TableRef;

    /// True when the query returns at least one record.
    async fn presence_check(&self, query: &RenderedQuery) -> Result<bool, TableError>;

    /// Bulk insert. Returns the number of rows actually stored; rows that
    /// collide with a uniqueness constraint are dropped.
    async fn insert_rows(&self, rows: &[Row]) -> Result<u64, TableError>;

    async fn fetch_rows(&self) -> Result<Vec<Row>, TableError>;
}
