use super::{Dialect, QueryResult, StorageAdapter};
use crate::core::{Record, Result, Value};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event};

#[derive(Debug, Default)]
struct Counters {
    queries: AtomicU64,
    executes: AtomicU64,
    upserts: AtomicU64,
    schema_syncs: AtomicU64,
    transactions: AtomicU64,
}

/// Point-in-time copy of an [`InstrumentedAdapter`]'s counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    pub queries: u64,
    pub executes: u64,
    pub upserts: u64,
    pub schema_syncs: u64,
    pub transactions: u64,
}

impl AdapterStats {
    pub fn statements(&self) -> u64 {
        self.queries + self.executes + self.upserts + self.schema_syncs
    }
}

/// Wraps an adapter and counts every call that reaches the store.
pub struct InstrumentedAdapter<A> {
    inner: A,
    counters: Counters,
}

impl<A: StorageAdapter> InstrumentedAdapter<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            counters: Counters::default(),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            queries: self.counters.queries.load(Ordering::SeqCst),
            executes: self.counters.executes.load(Ordering::SeqCst),
            upserts: self.counters.upserts.load(Ordering::SeqCst),
            schema_syncs: self.counters.schema_syncs.load(Ordering::SeqCst),
            transactions: self.counters.transactions.load(Ordering::SeqCst),
        }
    }

    pub fn reset(&self) {
        self.counters.queries.store(0, Ordering::SeqCst);
        self.counters.executes.store(0, Ordering::SeqCst);
        self.counters.upserts.store(0, Ordering::SeqCst);
        self.counters.schema_syncs.store(0, Ordering::SeqCst);
        self.counters.transactions.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl<A: StorageAdapter> StorageAdapter for InstrumentedAdapter<A> {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn connection_key(&self) -> &str {
        self.inner.connection_key()
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.counters.queries.fetch_add(1, Ordering::SeqCst);
        event!(Level::TRACE, sql, params = params.len(), "query");
        self.inner.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.counters.executes.fetch_add(1, Ordering::SeqCst);
        event!(Level::TRACE, sql, params = params.len(), "execute");
        self.inner.execute(sql, params).await
    }

    async fn upsert(&self, table: &str, conflict_columns: &[&str], data: &Record) -> Result<u64> {
        self.counters.upserts.fetch_add(1, Ordering::SeqCst);
        event!(Level::TRACE, table, columns = data.len(), "upsert");
        self.inner.upsert(table, conflict_columns, data).await
    }

    async fn sync_schema(&self, ddl: &str) -> Result<()> {
        self.counters.schema_syncs.fetch_add(1, Ordering::SeqCst);
        event!(Level::TRACE, ddl, "sync_schema");
        self.inner.sync_schema(ddl).await
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        self.counters.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.table_exists(table).await
    }

    async fn begin(&self) -> Result<()> {
        self.counters.transactions.fetch_add(1, Ordering::SeqCst);
        self.inner.begin().await
    }

    async fn commit(&self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        self.inner.rollback().await
    }
}
