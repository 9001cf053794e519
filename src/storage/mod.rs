//! Storage collaborator contract.
//!
//! Everything above this module talks to a backing store only through
//! [`StorageAdapter`]. SQL text is built once, with `?N`/`$N` placeholders
//! rendered by the adapter's [`Dialect`].

pub mod instrumented;
pub mod sqlite;

pub use instrumented::{AdapterStats, InstrumentedAdapter};
pub use sqlite::SqliteAdapter;

use crate::config::BackendKind;
use crate::core::{FieldKind, Record, Result, Value};
use async_trait::async_trait;

/// Columns an upsert never overwrites on conflict.
pub const PRESERVED_ON_CONFLICT: &[&str] = &["id", "created_at", "createdAt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    Postgres,
    DuckDb,
}

impl Dialect {
    /// 1-based positional placeholder.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{}", index),
            Dialect::Postgres | Dialect::DuckDb => format!("${}", index),
        }
    }

    /// Double-quoted identifier, so keywords like `order` stay usable as names.
    pub fn quote_ident(self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    pub fn column_type(self, kind: FieldKind) -> &'static str {
        match (self, kind) {
            (Dialect::Sqlite, FieldKind::Text | FieldKind::ForeignKey | FieldKind::Json) => "TEXT",
            (Dialect::Sqlite, FieldKind::Integer) => "INTEGER",
            (Dialect::Sqlite, FieldKind::Decimal) => "REAL",
            (Dialect::Sqlite, FieldKind::Boolean) => "BOOLEAN",
            (Dialect::Sqlite, FieldKind::DateTime) => "TIMESTAMP",

            (Dialect::Postgres, FieldKind::Text | FieldKind::ForeignKey) => "TEXT",
            (Dialect::Postgres, FieldKind::Integer) => "BIGINT",
            (Dialect::Postgres, FieldKind::Decimal) => "DOUBLE PRECISION",
            (Dialect::Postgres, FieldKind::Boolean) => "BOOLEAN",
            (Dialect::Postgres, FieldKind::DateTime) => "TIMESTAMPTZ",
            (Dialect::Postgres, FieldKind::Json) => "JSONB",

            (Dialect::DuckDb, FieldKind::Text | FieldKind::ForeignKey) => "VARCHAR",
            (Dialect::DuckDb, FieldKind::Integer) => "BIGINT",
            (Dialect::DuckDb, FieldKind::Decimal) => "DOUBLE",
            (Dialect::DuckDb, FieldKind::Boolean) => "BOOLEAN",
            (Dialect::DuckDb, FieldKind::DateTime) => "TIMESTAMP",
            (Dialect::DuckDb, FieldKind::Json) => "JSON",

            // never rendered as columns
            (_, FieldKind::OneToMany | FieldKind::ManyToMany) => "TEXT",
        }
    }

    /// Type used for the implicit text columns (`id`, `slug`, timestamps).
    pub fn text_type(self) -> &'static str {
        self.column_type(FieldKind::Text)
    }

    pub fn timestamp_type(self) -> &'static str {
        match self {
            // stored as fixed-width RFC 3339 text so ordering stays lexical
            Dialect::Sqlite => "TEXT",
            other => other.column_type(FieldKind::DateTime),
        }
    }

    pub fn table_exists_sql(self) -> String {
        match self {
            Dialect::Sqlite => {
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1".to_string()
            }
            Dialect::Postgres | Dialect::DuckDb => {
                "SELECT table_name FROM information_schema.tables WHERE table_name = $1".to_string()
            }
        }
    }

    /// `LIMIT`/`OFFSET` tail; SQLite needs a limit before any offset.
    pub fn limit_clause(self, limit: Option<usize>, offset: Option<usize>) -> String {
        match (limit, offset) {
            (None, None) => String::new(),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (None, Some(offset)) => match self {
                Dialect::Sqlite => format!(" LIMIT -1 OFFSET {}", offset),
                Dialect::Postgres | Dialect::DuckDb => format!(" OFFSET {}", offset),
            },
        }
    }
}

impl From<BackendKind> for Dialect {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Sqlite => Dialect::Sqlite,
            BackendKind::Postgres => Dialect::Postgres,
            BackendKind::DuckDb => Dialect::DuckDb,
        }
    }
}

/// Result of a row-returning statement. Rows are keyed by column name.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
    pub row_count: usize,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Record>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<&Record> {
        self.rows.first()
    }

    /// First column of the first row.
    pub fn scalar(&self) -> Option<&Value> {
        let column = self.columns.first()?;
        self.rows.first()?.get(column)
    }
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Identity of the backing store; equal keys share tables.
    fn connection_key(&self) -> &str;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Runs a statement and returns the affected row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Insert-or-update keyed on `conflict_columns`.
    async fn upsert(&self, table: &str, conflict_columns: &[&str], data: &Record) -> Result<u64> {
        let (sql, params) = build_upsert_sql(self.dialect(), table, conflict_columns, data);
        self.execute(&sql, &params).await
    }

    /// Applies idempotent DDL, possibly several `;`-separated statements.
    async fn sync_schema(&self, ddl: &str) -> Result<()> {
        for statement in split_statements(ddl) {
            self.execute(&statement, &[]).await?;
        }
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let sql = self.dialect().table_exists_sql();
        let result = self.query(&sql, &[Value::from(table)]).await?;
        Ok(!result.is_empty())
    }

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}

/// Builds `INSERT ... ON CONFLICT (...) DO UPDATE SET col = excluded.col`.
///
/// Conflict columns and [`PRESERVED_ON_CONFLICT`] keep their stored values.
/// When nothing is left to update the statement degrades to `DO NOTHING`.
pub fn build_upsert_sql(
    dialect: Dialect,
    table: &str,
    conflict_columns: &[&str],
    data: &Record,
) -> (String, Vec<Value>) {
    let columns: Vec<&str> = data.keys().map(String::as_str).collect();
    let quoted: Vec<String> = columns.iter().map(|c| dialect.quote_ident(c)).collect();
    let conflict: Vec<String> = conflict_columns
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect();
    let placeholders: Vec<String> = (1..=columns.len())
        .map(|index| dialect.placeholder(index))
        .collect();
    let params: Vec<Value> = data.values().cloned().collect();

    let updates: Vec<String> = columns
        .iter()
        .filter(|column| !conflict_columns.contains(column))
        .filter(|column| !PRESERVED_ON_CONFLICT.contains(column))
        .map(|column| format!("{col} = excluded.{col}", col = dialect.quote_ident(column)))
        .collect();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        dialect.quote_ident(table),
        quoted.join(", "),
        placeholders.join(", "),
        conflict.join(", "),
        action
    );
    (sql, params)
}

/// Splits a DDL script on `;` outside of single-quoted literals.
pub fn split_statements(ddl: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_literal = false;

    for ch in ddl.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                current.push(ch);
            }
            ';' if !in_literal => {
                if !current.trim().is_empty() {
                    statements.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }

    statements
}
