//! DDL generation for entity tables and the system tables.
//!
//! Generation is pure: the same field map and dialect always produce the
//! same statements.

use crate::core::types::{is_created_at, is_updated_at};
use crate::core::{ErrorCode, FieldDef, FieldKind, FieldMap, PersistError, Result, Value};
use crate::core::timestamp_to_storage;
use crate::storage::Dialect;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

// Schema helpers are split by concern for easier maintenance.
include!("schema_utils/naming_and_sql.rs");
include!("schema_utils/entity_tables.rs");
include!("schema_utils/system_tables.rs");

#[cfg(test)]
mod tests {
    use super::*;

    fn product_fields() -> FieldMap {
        FieldMap::new()
            .with("title", FieldDef::text().required())
            .with("price", FieldDef::decimal().min(0.0).default_value(0.0))
            .with("category", FieldDef::foreign_key("Category"))
            .with("reviews", FieldDef::one_to_many("Review"))
            .with("createdAt", FieldDef::datetime())
            .with("updated_at", FieldDef::datetime())
    }

    #[test]
    fn default_identity_columns_and_unique_pair() {
        let schema = generate("Product", &product_fields(), Dialect::Sqlite).expect("schema");

        assert_eq!(schema.table_name, "product");
        assert!(schema.ddl.starts_with(r#"CREATE TABLE IF NOT EXISTS "product" ("#));
        assert!(schema.ddl.contains(r#""id" TEXT PRIMARY KEY"#));
        assert!(schema.ddl.contains(r#""slug" TEXT NOT NULL"#));
        assert!(schema.ddl.contains(r#""context" TEXT NOT NULL DEFAULT ''"#));
        assert!(schema.ddl.contains(r#"UNIQUE ("slug", "context")"#));
        assert!(schema.ddl.contains(r#""title" TEXT NOT NULL DEFAULT ''"#));
        assert!(schema.ddl.contains(r#""price" REAL DEFAULT 0.0"#));
        assert!(!schema.ddl.contains("reviews"));
        assert_eq!(schema.conflict_columns(), vec!["slug", "context"]);
        assert_eq!(
            schema.indexes,
            vec![r#"CREATE INDEX IF NOT EXISTS idx_product_category ON "product" ("category")"#]
        );
    }

    #[test]
    fn timestamps_appear_exactly_once() {
        let schema = generate("Product", &product_fields(), Dialect::Sqlite).expect("schema");
        assert_eq!(schema.ddl.matches("created_at").count(), 1);
        assert_eq!(schema.ddl.matches("updated_at").count(), 1);
        assert!(!schema.ddl.contains("createdAt"));
        assert_eq!(
            schema.columns.iter().filter(|c| *c == "created_at").count(),
            1
        );
    }

    #[test]
    fn custom_primary_key_drops_identity_triad() {
        let fields = FieldMap::new()
            .with("code", FieldDef::text().primary_key())
            .with("label", FieldDef::text());
        let schema = generate("Sku", &fields, Dialect::Postgres).expect("schema");

        assert!(schema.ddl.contains(r#""code" TEXT PRIMARY KEY"#));
        assert!(!schema.ddl.contains(r#""id" TEXT"#));
        assert!(!schema.ddl.contains("slug"));
        assert!(!schema.ddl.contains("context"));
        assert!(!schema.ddl.contains("UNIQUE"));
        assert!(schema.ddl.contains(r#""created_at" TIMESTAMPTZ NOT NULL"#));
        assert_eq!(
            schema.indexes,
            vec![r#"CREATE INDEX IF NOT EXISTS idx_sku_code ON "sku" ("code")"#]
        );
        assert_eq!(schema.key_column(), "code");
        assert_eq!(schema.conflict_columns(), vec!["code"]);
    }

    #[test]
    fn column_types_follow_dialect() {
        let fields = FieldMap::new()
            .with("meta", FieldDef::json())
            .with("stock", FieldDef::integer())
            .with("active", FieldDef::boolean().default_value(true));
        let duck = generate("Item", &fields, Dialect::DuckDb).expect("schema");
        assert!(duck.ddl.contains(r#""meta" JSON"#));
        assert!(duck.ddl.contains(r#""stock" BIGINT"#));
        assert!(duck.ddl.contains(r#""active" BOOLEAN DEFAULT TRUE"#));
        assert!(duck.ddl.contains(r#""id" VARCHAR PRIMARY KEY"#));
    }

    #[test]
    fn keyword_names_are_quoted() {
        let fields = FieldMap::new()
            .with("group", FieldDef::text().indexed())
            .with("select", FieldDef::integer());
        let schema = generate("Order", &fields, Dialect::Sqlite).expect("schema");
        assert_eq!(schema.table_name, "order");
        assert!(schema.ddl.starts_with(r#"CREATE TABLE IF NOT EXISTS "order" ("#));
        assert!(schema.ddl.contains(r#""group" TEXT DEFAULT ''"#));
        assert!(schema.ddl.contains(r#""select" INTEGER"#));
        assert_eq!(
            schema.indexes,
            vec![r#"CREATE INDEX IF NOT EXISTS idx_order_group ON "order" ("group")"#]
        );
    }

    #[test]
    fn rejects_bad_identifiers_and_double_keys() {
        let bad = FieldMap::new().with("drop table", FieldDef::text());
        assert_eq!(
            generate("Thing", &bad, Dialect::Sqlite).unwrap_err().code(),
            ErrorCode::InvalidIdentifier
        );

        let double = FieldMap::new()
            .with("a", FieldDef::text().primary_key())
            .with("b", FieldDef::text().primary_key());
        assert!(generate("Thing", &double, Dialect::Sqlite).is_err());
    }

    #[test]
    fn schema_hash_is_stable() {
        let a = generate("Product", &product_fields(), Dialect::Sqlite).expect("schema");
        let b = generate("Product", &product_fields(), Dialect::Sqlite).expect("schema");
        assert_eq!(a.schema_hash(), b.schema_hash());
        assert!(a.script().contains(";\nCREATE INDEX"));
    }

    #[test]
    fn naming_helpers() {
        assert_eq!(default_table_name("ProductCategory"), "product_category");
        assert_eq!(default_table_name("Order2Line"), "order2_line");
        assert_eq!(slugify("  Hello, World!  "), "hello-world");
        assert_eq!(slugify("Crème Brûlée"), "cr-me-br-l-e");
        assert_eq!(value_to_sql_literal(&Value::Text("it's".into())), "'it''s'");
        assert_eq!(value_to_sql_literal(&Value::Float(2.0)), "2.0");
        assert!(is_valid_identifier("price_2"));
        assert!(!is_valid_identifier("price; DROP"));
    }

    #[test]
    fn system_tables_use_prefix() {
        let tables = SystemTables::new("persistry_");
        let script = tables.script(Dialect::Sqlite);
        assert!(script.contains("CREATE TABLE IF NOT EXISTS persistry_context_memory"));
        assert!(script.contains("UNIQUE (owner_type, owner_id, scope, key, version)"));
        assert!(script.contains("persistry_schema_versions"));
        assert!(script.contains("persistry_registry_snapshot"));
        assert!(script.contains("persistry_signal_log"));
        assert_eq!(tables.all().len(), 4);
    }
}
