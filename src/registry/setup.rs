use super::{CellMap, Registry, TypeMetadata, type_key};
use crate::collection::{Collection, CollectionShared};
use crate::core::{PersistError, Record, Result, Value};
use crate::schema::{GeneratedSchema, SystemTables, new_entity_id};
use crate::session::PersistSession;
use chrono::Utc;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{Level, event};

fn cell<K: Eq + Hash, V>(map: &CellMap<K, V>, key: K) -> Result<Arc<OnceCell<V>>> {
    let mut cells = map.lock()?;
    Ok(cells.entry(key).or_default().clone())
}

impl Registry {
    pub fn system_tables(&self) -> SystemTables {
        SystemTables::new(&self.config.table_prefix)
    }

    /// Creates the system tables once per connection key.
    ///
    /// Inside a transaction the memo is bypassed so a rollback cannot leave
    /// it claiming tables that no longer exist.
    pub async fn ensure_system_tables(&self, session: &PersistSession) -> Result<()> {
        let script = self.system_tables().script(session.dialect());
        if session.in_transaction() {
            return session.sync_schema(&script).await;
        }

        let slot = cell(&self.system_tables, session.connection_key().to_string())?;
        slot.get_or_try_init(|| async {
            session.sync_schema(&script).await?;
            event!(
                Level::DEBUG,
                connection = session.connection_key(),
                prefix = %self.config.table_prefix,
                "Initialized system tables"
            );
            Ok::<_, PersistError>(())
        })
        .await?;
        Ok(())
    }

    /// Creates the backing table for `type_name` if needed and returns the
    /// schema in the session's dialect.
    ///
    /// Concurrent callers for the same `(connection, table)` share one DDL
    /// execution. A failed setup leaves the slot empty so the next call retries.
    pub async fn ensure_table(
        &self,
        session: &PersistSession,
        type_name: &str,
    ) -> Result<Arc<GeneratedSchema>> {
        let meta = self.require(type_name)?;
        let schema = meta.schema_for(session.dialect())?;

        if session.in_transaction() {
            self.ensure_system_tables(session).await?;
            self.apply_schema(session, &schema).await?;
            return Ok(schema);
        }

        let key = (session.connection_key().to_string(), schema.table_name.clone());
        let slot = cell(&self.tables, key)?;
        slot.get_or_try_init(|| async {
            self.ensure_system_tables(session).await?;
            self.apply_schema(session, &schema).await
        })
        .await?;
        Ok(schema)
    }

    async fn apply_schema(&self, session: &PersistSession, schema: &GeneratedSchema) -> Result<()> {
        session.sync_schema(&schema.script()).await?;

        let row: Record = crate::record! {
            "table_name" => schema.table_name.as_str(),
            "schema_hash" => schema.schema_hash(),
            "ddl" => schema.script(),
            "applied_at" => Utc::now(),
        };
        session
            .upsert(&self.system_tables().schema_versions(), &["table_name"], &row)
            .await?;

        event!(
            Level::DEBUG,
            type_name = %schema.type_name,
            table = %schema.table_name,
            connection = session.connection_key(),
            "Synchronized entity table"
        );
        Ok(())
    }

    /// The collection for `type_name` on the session's connection.
    ///
    /// Shared state is built once per `(type, connection)`: table setup and
    /// the type's initializer run on the first request only, and concurrent
    /// first requests wait for that single build. Unknown types fail.
    ///
    /// A first request made inside a transaction builds uncached state, so a
    /// rollback cannot leave a cached collection over dropped tables.
    pub async fn get_or_create_collection(
        self: &Arc<Self>,
        type_name: &str,
        session: &PersistSession,
    ) -> Result<Collection> {
        let meta = self.require(type_name)?;
        let key = (type_key(&meta.name), session.connection_key().to_string());
        let slot = cell(&self.collections, key)?;

        let shared = match slot.get() {
            Some(shared) => shared.clone(),
            None if session.in_transaction() => self.build_collection(&meta, session).await?,
            None => slot
                .get_or_try_init(|| self.build_collection(&meta, session))
                .await?
                .clone(),
        };

        Ok(Collection::new(self.clone(), meta, shared, session.clone()))
    }

    async fn build_collection(
        self: &Arc<Self>,
        meta: &Arc<TypeMetadata>,
        session: &PersistSession,
    ) -> Result<Arc<CollectionShared>> {
        let schema = self.ensure_table(session, &meta.name).await?;
        let shared = Arc::new(CollectionShared::new(
            schema,
            session.connection_key(),
            self.system_tables().context_memory(),
        ));
        if let Some(init) = &meta.collection_initializer {
            let collection =
                Collection::new(self.clone(), meta.clone(), shared.clone(), session.clone());
            init(collection).await?;
        }
        event!(
            Level::DEBUG,
            type_name = %meta.name,
            connection = session.connection_key(),
            cached = !session.in_transaction(),
            "Created collection"
        );
        Ok(shared)
    }

    /// Writes one snapshot row per registered type. Returns the row count.
    pub async fn persist_snapshot(&self, session: &PersistSession) -> Result<usize> {
        self.ensure_system_tables(session).await?;
        let table = self.system_tables().registry_snapshot();

        let mut written = 0;
        for name in self.registered_types() {
            let Some(meta) = self.get(&name) else {
                continue;
            };
            let row: Record = crate::record! {
                "type_name" => meta.name.as_str(),
                "table_name" => meta.table_name.as_str(),
                "fields_json" => serde_json::to_value(&meta.fields)?,
                "relationships_json" => serde_json::to_value(self.relationships(&name))?,
                "updated_at" => Utc::now(),
            };
            session.upsert(&table, &["type_name"], &row).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Appends a lifecycle signal when the signal log is enabled.
    pub(crate) async fn record_signal(
        &self,
        session: &PersistSession,
        type_name: &str,
        entity_id: &str,
        signal: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        if !self.config.signal_log {
            return Ok(());
        }
        self.ensure_system_tables(session).await?;
        let row: Record = crate::record! {
            "id" => new_entity_id(),
            "type_name" => type_name,
            "entity_id" => entity_id,
            "signal" => signal,
            "payload" => Value::Json(payload),
            "created_at" => Utc::now(),
        };
        session
            .upsert(&self.system_tables().signal_log(), &["id"], &row)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::{FieldDef, Value};
    use crate::registry::{Registry, TypeDescriptor};
    use crate::session::PersistSession;
    use crate::storage::{InstrumentedAdapter, SqliteAdapter};
    use std::sync::Arc;

    fn instrumented() -> (Arc<InstrumentedAdapter<SqliteAdapter>>, PersistSession) {
        let adapter = Arc::new(InstrumentedAdapter::new(
            SqliteAdapter::open_in_memory().expect("sqlite"),
        ));
        let session = PersistSession::new(adapter.clone());
        (adapter, session)
    }

    #[tokio::test]
    async fn table_setup_runs_once_per_connection() {
        let registry = Registry::new();
        registry
            .register(TypeDescriptor::new("Widget").field("label", FieldDef::text()))
            .expect("register");
        let (adapter, session) = instrumented();

        let (a, b) = tokio::join!(
            registry.ensure_table(&session, "Widget"),
            registry.ensure_table(&session, "widget")
        );
        assert!(Arc::ptr_eq(&a.expect("a"), &b.expect("b")));
        registry.ensure_table(&session, "Widget").await.expect("again");

        // system tables plus the entity table
        assert_eq!(adapter.stats().schema_syncs, 2);
        assert!(session.table_exists("widget").await.expect("exists"));

        let versions = session
            .query(
                "SELECT table_name FROM persistry_schema_versions",
                &[],
            )
            .await
            .expect("versions");
        assert_eq!(versions.rows.len(), 1);
    }

    #[tokio::test]
    async fn unknown_type_cannot_get_a_collection() {
        let registry = Registry::new();
        let (_, session) = instrumented();
        let err = registry
            .get_or_create_collection("Nope", &session)
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::core::ErrorCode::UnknownType);
    }

    #[tokio::test]
    async fn snapshot_writes_one_row_per_type() {
        let registry = Registry::new();
        registry
            .register(TypeDescriptor::new("Author").field("name", FieldDef::text()))
            .expect("author");
        registry
            .register(TypeDescriptor::new("Book").field("author", FieldDef::foreign_key("Author")))
            .expect("book");
        let (_, session) = instrumented();

        assert_eq!(registry.persist_snapshot(&session).await.expect("snapshot"), 2);
        let rows = session
            .query(
                "SELECT relationships_json FROM persistry_registry_snapshot WHERE type_name = ?1",
                &[Value::from("Book")],
            )
            .await
            .expect("rows");
        let stored = rows.scalar().and_then(Value::as_str).unwrap_or_default().to_string();
        assert!(stored.contains("\"fieldName\":\"author\""));
    }
}
