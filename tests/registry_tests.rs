use futures::FutureExt;
use persistry::{
    Collection, ConnectionConfig, ErrorCode, ErrorKind, FieldDef, InstrumentedAdapter,
    PersistError, PersistSession, Registry, SqliteAdapter, TypeDescriptor,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;
use tokio_test::{assert_err, assert_ok};

fn shop_types(registry: &Registry) {
    registry
        .register(TypeDescriptor::new("Category").field("label", FieldDef::text().required()))
        .unwrap();
    registry
        .register(
            TypeDescriptor::new("Product")
                .field("title", FieldDef::text().required().max_length(80))
                .field("price", FieldDef::decimal().min(0.0))
                .field("category", FieldDef::foreign_key("Category")),
        )
        .unwrap();
}

#[test]
fn second_registration_changes_nothing() {
    let registry = Registry::new();
    shop_types(&registry);

    let schema = registry.schema("Product").unwrap();
    let fields = registry.fields("Product").unwrap();
    let validators = registry.validators("Product").unwrap();

    let replaced = TypeDescriptor::new("Product").field("sku", FieldDef::text().primary_key());
    assert!(!registry.register(replaced).unwrap());

    assert!(Arc::ptr_eq(&schema, &registry.schema("product").unwrap()));
    assert_eq!(fields, registry.fields("Product").unwrap());
    assert!(Arc::ptr_eq(&validators, &registry.validators("Product").unwrap()));
    assert_eq!(registry.registered_types(), vec!["Category", "Product"]);
}

#[test]
fn custom_primary_key_replaces_identity_triad() {
    let registry = Registry::new();
    registry
        .register(
            TypeDescriptor::new("Country")
                .field("iso", FieldDef::text().primary_key())
                .field("label", FieldDef::text()),
        )
        .unwrap();

    let schema = registry.schema("Country").unwrap();
    assert!(!schema.ddl.contains("slug"));
    assert!(!schema.ddl.contains(r#""id""#));
    assert!(schema.ddl.contains(r#""iso" TEXT PRIMARY KEY"#));
    assert!(
        schema
            .indexes
            .iter()
            .any(|index| index.contains("idx_country_iso"))
    );
}

#[test]
fn cycles_fail_and_chains_order_dependencies_first() {
    let registry = Registry::new();
    registry
        .register(TypeDescriptor::new("X").field("y", FieldDef::foreign_key("Y")))
        .unwrap();
    registry
        .register(TypeDescriptor::new("Y").field("z", FieldDef::foreign_key("Z")))
        .unwrap();
    registry.register(TypeDescriptor::new("Z")).unwrap();
    assert_eq!(registry.initialization_order().unwrap(), vec!["Z", "Y", "X"]);

    let err = assert_err!(
        registry.register(TypeDescriptor::new("W").field("x", FieldDef::foreign_key("W2")))
            .and_then(|_| registry.register(
                TypeDescriptor::new("W2").field("w", FieldDef::foreign_key("W"))
            ))
    );
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.code(), ErrorCode::CircularDependency);
    assert!(err.message().contains('W'));
}

#[test]
fn unknown_relationship_fields_are_configuration_errors() {
    let registry = Registry::new();
    shop_types(&registry);

    let rel = registry.relationship("Product", "category").unwrap();
    assert_eq!(rel.target_type, "Category");

    let err = assert_err!(registry.relationship("Product", "vendor"));
    assert_eq!(err.code(), ErrorCode::UnknownRelationship);
    let err = assert_err!(registry.relationship("Ghost", "anything"));
    assert_eq!(err.code(), ErrorCode::UnknownType);
}

#[tokio::test]
async fn concurrent_first_requests_share_one_collection() {
    let registry = Registry::new();
    let initialized = Arc::new(AtomicUsize::new(0));
    let counter = initialized.clone();
    registry
        .register(
            TypeDescriptor::new("Widget")
                .field("label", FieldDef::text())
                .collection_initializer(Arc::new(move |_collection: Collection| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), PersistError>(())
                    }
                    .boxed()
                })),
        )
        .unwrap();

    let adapter = Arc::new(InstrumentedAdapter::new(SqliteAdapter::open_in_memory().unwrap()));
    let session = PersistSession::new(adapter.clone());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            let session = session.clone();
            tokio::spawn(async move { registry.get_or_create_collection("Widget", &session).await })
        })
        .collect();

    let mut collections = Vec::new();
    for handle in handles {
        collections.push(assert_ok!(handle.await.unwrap()));
    }

    assert!(collections.windows(2).all(|pair| pair[0].same_instance(&pair[1])));
    assert_eq!(initialized.load(Ordering::SeqCst), 1);
    // system tables plus the widget table
    assert_eq!(adapter.stats().schema_syncs, 2);
}

#[tokio::test]
async fn distinct_connections_get_distinct_collections() {
    let registry = Registry::new();
    shop_types(&registry);
    let dir = tempdir().unwrap();
    let path = dir.path().join("shop.db");
    let file_config = ConnectionConfig::sqlite_file(path.to_str().unwrap());

    let first = PersistSession::open(&file_config).unwrap();
    let tuned = file_config.clone().query_timeout(Duration::from_secs(9));
    let second = PersistSession::open(&tuned).unwrap();
    let memory = PersistSession::in_memory().unwrap();

    let a = registry.get_or_create_collection("Product", &first).await.unwrap();
    let b = registry.get_or_create_collection("Product", &second).await.unwrap();
    let c = registry.get_or_create_collection("Product", &memory).await.unwrap();

    assert!(a.same_instance(&b));
    assert!(!a.same_instance(&c));
}

#[tokio::test]
async fn failed_table_setup_can_be_retried() {
    let registry = Registry::new();
    shop_types(&registry);
    let session = PersistSession::in_memory().unwrap();

    // occupy the table name with an incompatible view so setup fails
    session
        .execute("CREATE VIEW product AS SELECT 1 AS x", &[])
        .await
        .unwrap();
    assert_err!(registry.ensure_table(&session, "Product").await);

    session.execute("DROP VIEW product", &[]).await.unwrap();
    assert_ok!(registry.ensure_table(&session, "Product").await);
    assert!(session.table_exists("product").await.unwrap());
}

#[tokio::test]
async fn snapshot_rows_cover_every_type() {
    let registry = Registry::new();
    shop_types(&registry);
    let session = PersistSession::in_memory().unwrap();

    assert_eq!(registry.persist_snapshot(&session).await.unwrap(), 2);
    let rows = session
        .query(
            "SELECT type_name FROM persistry_registry_snapshot ORDER BY type_name",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(rows.row_count, 2);
}
