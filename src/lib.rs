// ============================================================================
// Persistry Library
// ============================================================================
//
// Metadata-driven persistence. Types are registered once with a `Registry`,
// which generates their tables and validators; a `Collection` per type and
// connection runs queries and batches relationship loading; `Entity` carries
// identity and the save/delete lifecycle; `ContextStore` adds scoped memory.

pub mod core;
pub mod config;
pub mod storage;
pub mod session;
pub mod schema;
pub mod query;
pub mod registry;
pub mod collection;
pub mod entity;
pub mod context;
pub mod model;
pub mod prelude;

// Re-export main types for convenience
pub use core::{
    ErrorCode, ErrorKind, ErrorReport, FieldDef, FieldKind, FieldMap, FieldOptions, PersistError,
    Record, Result, ValidationError, Value,
};
pub use config::{BackendKind, ConnectionConfig, RegistryConfig, RetryPolicy};
pub use storage::{
    AdapterStats, Dialect, InstrumentedAdapter, QueryResult, SqliteAdapter, StorageAdapter,
};
pub use session::PersistSession;
pub use schema::{GeneratedSchema, SystemTables};

// Re-export the persistence API
pub use query::{Direction, Filter, FilterExpr, ListOptions, OrderBy};
pub use registry::{
    AsyncPredicate, CollectionInitializer, Hook, Registry, Relationship, TypeDescriptor,
    TypeMetadata,
};
pub use collection::{Collection, Lookup};
pub use entity::{Entity, EntityState, RelationSlot};
pub use context::{ContextStore, MemoryRecord, RecallOptions, RememberOptions};
pub use model::EntityModel;
