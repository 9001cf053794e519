use crate::config::ConnectionConfig;
use crate::core::{Record, Result, Value};
use crate::storage::{Dialect, QueryResult, SqliteAdapter, StorageAdapter};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

/// Handle to a backing store.
///
/// Clones share the adapter and the transaction gate. A session handed to a
/// [`with_transaction`](PersistSession::with_transaction) callback is bound
/// to that transaction; nested calls on it run inline.
#[derive(Clone)]
pub struct PersistSession {
    adapter: Arc<dyn StorageAdapter>,
    tx_gate: Arc<Mutex<()>>,
    in_transaction: bool,
}

impl fmt::Debug for PersistSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistSession")
            .field("connection_key", &self.adapter.connection_key())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl PersistSession {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            tx_gate: Arc::new(Mutex::new(())),
            in_transaction: false,
        }
    }

    /// Opens a session for an embedded SQLite configuration.
    pub fn open(config: &ConnectionConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteAdapter::open(config)?)))
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(&ConnectionConfig::sqlite_memory())
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    pub fn dialect(&self) -> Dialect {
        self.adapter.dialect()
    }

    pub fn connection_key(&self) -> &str {
        self.adapter.connection_key()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.adapter.query(sql, params).await
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.adapter.execute(sql, params).await
    }

    pub async fn upsert(
        &self,
        table: &str,
        conflict_columns: &[&str],
        data: &Record,
    ) -> Result<u64> {
        self.adapter.upsert(table, conflict_columns, data).await
    }

    pub async fn sync_schema(&self, ddl: &str) -> Result<()> {
        self.adapter.sync_schema(ddl).await
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        self.adapter.table_exists(table).await
    }

    /// Executes a closure within a transaction scope.
    ///
    /// If the closure returns `Ok`, the transaction is committed.
    /// If it returns `Err`, the transaction is rolled back and the error is
    /// returned unchanged.
    pub async fn with_transaction<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce(PersistSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.in_transaction {
            return op(self.clone()).await;
        }

        let _gate = self.tx_gate.lock().await;
        self.adapter.begin().await?;

        let tx_session = Self {
            adapter: self.adapter.clone(),
            tx_gate: self.tx_gate.clone(),
            in_transaction: true,
        };

        match op(tx_session).await {
            Ok(value) => {
                if let Err(err) = self.adapter.commit().await {
                    self.rollback_quietly().await;
                    return Err(err);
                }
                Ok(value)
            }
            Err(err) => {
                self.rollback_quietly().await;
                Err(err)
            }
        }
    }

    async fn rollback_quietly(&self) {
        if let Err(err) = self.adapter.rollback().await {
            event!(Level::ERROR, error = %err, "Transaction rollback failed");
        }
    }
}
