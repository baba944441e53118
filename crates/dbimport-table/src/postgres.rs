use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgPoolOptions, PgTypeInfo};
use sqlx::query::Query;
use sqlx::{Encode, PgPool, Postgres, Type};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{RenderedQuery, Row, Scalar, TableError, TableRef, TableStore};

const DEFAULT_SCHEMA: &str = "public";

/// A Postgres table. The dataset part of the table name is the schema.
///
/// Inserts use `ON CONFLICT DO NOTHING`, so a unique index on the logical key
/// closes the window in which two concurrent imports both pass the presence
/// check.
#[derive(Clone)]
pub struct PostgresTable {
    pool: PgPool,
    table: TableRef,
    columns: BTreeSet<String>,
}

impl std::fmt::Debug for PostgresTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTable")
            .field("table", &self.table)
            .field("columns", &self.columns)
            .finish()
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A NULL parameter sent with the unspecified type OID, so Postgres infers
/// its type from the expression it appears in.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn bind_scalar<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Scalar,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Scalar::Null => query.bind(UntypedNull),
        Scalar::Bool(b) => query.bind(*b),
        Scalar::Int(i) => query.bind(*i),
        Scalar::Float(f) => query.bind(*f),
        Scalar::Text(s) => query.bind(s.clone()),
    }
}

impl PostgresTable {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, TableError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(pool)
    }

    /// Opens an existing table, loading its column list.
    pub async fn open(pool: PgPool, table: TableRef) -> Result<Self, TableError> {
        let schema = table.dataset_or(DEFAULT_SCHEMA).to_string();
        let columns: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT column_name::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            "#,
        )
        .bind(&schema)
        .bind(&table.table)
        .fetch_all(&pool)
        .await?;

        if columns.is_empty() {
            return Err(TableError::TableNotFound(table.to_string()));
        }

        Ok(Self {
            pool,
            table,
            columns: columns.into_iter().map(|(name,)| name).collect(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn columns(&self) -> &BTreeSet<String> {
        &self.columns
    }

    fn qualified_name(&self) -> String {
        format!(
            "{}.{}",
            quote_ident(self.table.dataset_or(DEFAULT_SCHEMA)),
            quote_ident(&self.table.table)
        )
    }

    /// Creates an empty table with the same structure and constraints, used
    /// as a disposable verification target.
    pub async fn create_scratch_copy(&self) -> Result<PostgresTable, TableError> {
        let suffix = Uuid::new_v4().simple().to_string();
        let scratch_ref = self
            .table
            .sibling(&format!("{}__verify_{}", self.table.table, &suffix[..8]));
        let scratch = PostgresTable {
            pool: self.pool.clone(),
            table: scratch_ref,
            columns: self.columns.clone(),
        };

        let statement = format!(
            "CREATE TABLE {} (LIKE {} INCLUDING ALL)",
            scratch.qualified_name(),
            self.qualified_name()
        );
        sqlx::query(&statement).execute(&self.pool).await?;
        info!(table = %scratch.table, "created scratch table");
        Ok(scratch)
    }

    pub async fn drop_table(self) -> Result<(), TableError> {
        let statement = format!("DROP TABLE IF EXISTS {}", self.qualified_name());
        sqlx::query(&statement).execute(&self.pool).await?;
        info!(table = %self.table, "dropped table");
        Ok(())
    }
}

#[async_trait]
impl TableStore for PostgresTable {
    fn table_ref(&self) -> &TableRef {
        &self.table
    }

    async fn presence_check(&self, query: &RenderedQuery) -> Result<bool, TableError> {
        let mut prepared = sqlx::query(&query.sql);
        for param in &query.params {
            prepared = bind_scalar(prepared, param);
        }
        let found = prepared.fetch_optional(&self.pool).await?;
        debug!(sql = %query.sql, present = found.is_some(), "presence check");
        Ok(found.is_some())
    }

    async fn insert_rows(&self, rows: &[Row]) -> Result<u64, TableError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let used: BTreeSet<&str> = rows.iter().flat_map(|row| row.columns()).collect();
        let unknown: Vec<String> = used
            .iter()
            .filter(|column| !self.columns.contains(**column))
            .map(|column| column.to_string())
            .collect();
        if !unknown.is_empty() {
            return Err(TableError::SchemaMismatch {
                table: self.table.to_string(),
                columns: unknown,
            });
        }

        let column_list = used
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        let target = self.qualified_name();
        let statement = format!(
            "INSERT INTO {target} ({column_list}) \
             SELECT {column_list} FROM jsonb_populate_recordset(NULL::{target}, $1) \
             ON CONFLICT DO NOTHING"
        );

        let payload = Value::Array(rows.iter().map(Row::to_json).collect());
        let result = sqlx::query(&statement)
            .bind(payload)
            .execute(&self.pool)
            .await?;

        info!(
            table = %self.table,
            submitted = rows.len(),
            inserted = result.rows_affected(),
            "bulk insert finished"
        );
        Ok(result.rows_affected())
    }

    async fn fetch_rows(&self) -> Result<Vec<Row>, TableError> {
        let statement = format!("SELECT to_jsonb(t) FROM {} AS t", self.qualified_name());
        let records: Vec<(Value,)> = sqlx::query_as(&statement).fetch_all(&self.pool).await?;
        Ok(records
            .iter()
            .filter_map(|(value,)| Row::from_json_object(value))
            .collect())
    }
}
