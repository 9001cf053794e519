//! Recommended imports grouped by abstraction level.
//!
//! `dx` covers registering types and working with collections and entities.
//! `advanced` is an explicit escape hatch for storage and schema internals.

pub mod dx {
    //! Everyday surface: registration, querying, saving, context memory.
    pub use crate::record;
    pub use crate::{
        Collection, ConnectionConfig, Entity, EntityModel, FieldDef, Filter, ListOptions, Lookup,
        OrderBy, PersistError, PersistSession, RecallOptions, Record, Registry, RememberOptions,
        Result, TypeDescriptor, Value,
    };
}

pub mod advanced {
    //! Storage adapters, generated schemas and low-level query compilation.
    //!
    //! Application code should normally stay on `prelude::dx`.
    pub use crate::query::{WhereClause, build_order_by, build_where};
    pub use crate::schema::{generate, generate_for_table};
    pub use crate::storage::{build_upsert_sql, split_statements};
    pub use crate::{
        AdapterStats, Dialect, GeneratedSchema, InstrumentedAdapter, SqliteAdapter, StorageAdapter,
        SystemTables,
    };
}
