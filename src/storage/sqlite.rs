use super::{Dialect, QueryResult, StorageAdapter};
use crate::config::{BackendKind, ConnectionConfig};
use crate::core::{ErrorCode, PersistError, Record, Result, Value, timestamp_to_storage};
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, ErrorCode as SqliteCode, params_from_iter};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Embedded backend over a single rusqlite connection.
///
/// Statements run on the blocking pool; the connection is held only for
/// the duration of one statement.
#[derive(Clone)]
pub struct SqliteAdapter {
    conn: Arc<Mutex<Connection>>,
    connection_key: String,
}

impl SqliteAdapter {
    pub fn open(config: &ConnectionConfig) -> Result<Self> {
        config.validate()?;
        if config.backend != BackendKind::Sqlite {
            return Err(PersistError::configuration(
                ErrorCode::InvalidConfig,
                format!("SqliteAdapter cannot open a {} connection", config.backend),
            ));
        }

        let conn = if config.is_memory() {
            Connection::open_in_memory()
        } else {
            Connection::open(&config.database)
        }
        .map_err(|err| {
            PersistError::database(
                ErrorCode::Connection,
                format!("Failed to open '{}': {}", config.to_url(), err),
                false,
            )
            .with_source(err)
        })?;

        conn.busy_timeout(config.connect_timeout.min(Duration::from_secs(5)))
            .map_err(map_sqlite_error)?;

        // every in-memory connection is its own database
        let connection_key = if config.is_memory() {
            format!("{}-{}", config.fingerprint(), uuid::Uuid::new_v4().simple())
        } else {
            config.fingerprint()
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            connection_key,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(&ConnectionConfig::sqlite_memory())
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock()?;
            op(&guard)
        })
        .await
        .map_err(|err| {
            PersistError::runtime(ErrorCode::Internal, format!("SQLite task failed: {}", err))
                .with_source(err)
        })?
    }
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn connection_key(&self) -> &str {
        &self.connection_key
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let sql = sql.to_string();
        let params: Vec<SqlValue> = params.iter().map(to_sql_value).collect();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(map_sqlite_error)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

            let mut rows = stmt
                .query(params_from_iter(params.iter()))
                .map_err(map_sqlite_error)?;

            let mut records = Vec::new();
            while let Some(row) = rows.next().map_err(map_sqlite_error)? {
                let mut record = Record::new();
                for (index, column) in columns.iter().enumerate() {
                    let value = row.get_ref(index).map_err(map_sqlite_error)?;
                    record.insert(column.clone(), from_value_ref(value));
                }
                records.push(record);
            }

            Ok(QueryResult::new(columns, records))
        })
        .await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let sql = sql.to_string();
        let params: Vec<SqlValue> = params.iter().map(to_sql_value).collect();

        self.with_conn(move |conn| {
            let affected = conn
                .execute(&sql, params_from_iter(params.iter()))
                .map_err(map_sqlite_error)?;
            Ok(affected as u64)
        })
        .await
    }

    async fn sync_schema(&self, ddl: &str) -> Result<()> {
        let ddl = ddl.to_string();
        self.with_conn(move |conn| {
            conn.execute_batch(&ddl).map_err(|err| {
                let transient = is_transient(&err);
                let code = if transient {
                    ErrorCode::Transient
                } else {
                    ErrorCode::SchemaFailed
                };
                PersistError::database(code, err.to_string(), transient)
                    .with_detail("ddl", &ddl)
                    .with_source(err)
            })
        })
        .await
    }

    async fn begin(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("BEGIN").map_err(map_sqlite_error))
            .await
    }

    async fn commit(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("COMMIT").map_err(map_sqlite_error))
            .await
    }

    async fn rollback(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("ROLLBACK").map_err(map_sqlite_error))
            .await
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
        Value::Timestamp(ts) => SqlValue::Text(timestamp_to_storage(ts)),
        Value::Json(json) => SqlValue::Text(json.to_string()),
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Json(serde_json::Value::Array(
            bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
        )),
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(SqliteCode::DatabaseBusy | SqliteCode::DatabaseLocked)
    )
}

/// Maps rusqlite failures onto database error codes. Constraint messages are
/// kept verbatim so the entity layer can recover the column name.
pub(crate) fn map_sqlite_error(err: rusqlite::Error) -> PersistError {
    let message = err.to_string();

    if is_transient(&err) {
        return PersistError::database(ErrorCode::Transient, message, true).with_source(err);
    }

    if err.sqlite_error_code() == Some(SqliteCode::ConstraintViolation) {
        let code = if message.contains("UNIQUE") {
            ErrorCode::UniqueViolation
        } else if message.contains("NOT NULL") {
            ErrorCode::NotNullViolation
        } else {
            ErrorCode::ConstraintViolation
        };
        return PersistError::database(code, message, false).with_source(err);
    }

    PersistError::database(ErrorCode::QueryFailed, message, false).with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_maps_rows_by_column() {
        let adapter = SqliteAdapter::open_in_memory().expect("open");
        adapter
            .sync_schema("CREATE TABLE t (id TEXT PRIMARY KEY, n INTEGER, f REAL, flag BOOLEAN)")
            .await
            .expect("ddl");
        adapter
            .execute(
                "INSERT INTO t (id, n, f, flag) VALUES (?1, ?2, ?3, ?4)",
                &[Value::from("a"), Value::from(3), Value::from(1.5), Value::from(true)],
            )
            .await
            .expect("insert");

        let result = adapter
            .query("SELECT id, n, f, flag FROM t WHERE id = ?1", &[Value::from("a")])
            .await
            .expect("select");
        assert_eq!(result.row_count, 1);
        let row = result.first().expect("row");
        assert_eq!(row["n"], Value::Integer(3));
        assert_eq!(row["f"], Value::Float(1.5));
        assert_eq!(row["flag"], Value::Integer(1));
        assert_eq!(result.columns, vec!["id", "n", "f", "flag"]);
    }

    #[tokio::test]
    async fn constraint_failures_keep_their_message() {
        let adapter = SqliteAdapter::open_in_memory().expect("open");
        adapter
            .sync_schema("CREATE TABLE t (id TEXT PRIMARY KEY, name TEXT NOT NULL)")
            .await
            .expect("ddl");
        adapter
            .execute(
                "INSERT INTO t (id, name) VALUES (?1, ?2)",
                &[Value::from("a"), Value::from("x")],
            )
            .await
            .expect("insert");

        let dup = adapter
            .execute(
                "INSERT INTO t (id, name) VALUES (?1, ?2)",
                &[Value::from("a"), Value::from("y")],
            )
            .await
            .unwrap_err();
        assert_eq!(dup.code(), ErrorCode::UniqueViolation);
        assert!(dup.message().contains("UNIQUE constraint failed: t.id"));
        assert!(!dup.is_transient());

        let null = adapter
            .execute("INSERT INTO t (id, name) VALUES (?1, NULL)", &[Value::from("b")])
            .await
            .unwrap_err();
        assert_eq!(null.code(), ErrorCode::NotNullViolation);
    }

    #[tokio::test]
    async fn table_exists_and_memory_keys_are_distinct() {
        let a = SqliteAdapter::open_in_memory().expect("open");
        let b = SqliteAdapter::open_in_memory().expect("open");
        assert_ne!(a.connection_key(), b.connection_key());

        assert!(!a.table_exists("widgets").await.expect("exists"));
        a.sync_schema("CREATE TABLE widgets (id TEXT)").await.expect("ddl");
        assert!(a.table_exists("widgets").await.expect("exists"));
        assert!(!b.table_exists("widgets").await.expect("exists"));
    }

    #[tokio::test]
    async fn file_backed_connections_share_a_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("store.db");
        let config = ConnectionConfig::sqlite_file(path.to_str().expect("utf8 path"));

        let first = SqliteAdapter::open(&config).expect("open");
        let second = SqliteAdapter::open(&config).expect("open");
        assert_eq!(first.connection_key(), second.connection_key());
    }

    #[test]
    fn rejects_non_sqlite_config() {
        let config = ConnectionConfig::from_url("postgres://u:p@localhost/app").expect("url");
        assert!(SqliteAdapter::open(&config).is_err());
    }
}
