//! Process-wide catalogue of entity types.
//!
//! A [`Registry`] is created once, shared as `Arc<Registry>` and handed to
//! every collection and entity it produces. Type metadata is immutable once
//! stored; regeneration swaps in a fresh `Arc`.

mod graph;
mod setup;
pub mod validators;

pub use graph::Relationship;
pub use validators::{AsyncPredicate, Rule, Validator};

use crate::collection::{Collection, CollectionShared};
use crate::config::{BackendKind, RegistryConfig};
use crate::core::{ErrorCode, FieldDef, FieldMap, PersistError, Result};
use crate::entity::Entity;
use crate::model::{EntityModel, extract_fields};
use crate::schema::{GeneratedSchema, default_table_name, generate_for_table};
use crate::storage::Dialect;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::{Level, event};

/// Lifecycle hook run with a snapshot of the entity.
pub type Hook = Arc<dyn Fn(Entity) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Runs once when the collection for a type is first built on a connection.
pub type CollectionInitializer =
    Arc<dyn Fn(Collection) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Everything needed to register one type.
#[derive(Clone, Default)]
pub struct TypeDescriptor {
    name: String,
    fields: FieldMap,
    table_name: Option<String>,
    collection_initializer: Option<CollectionInitializer>,
    before_delete: Option<Hook>,
    after_delete: Option<Hook>,
    async_validators: Vec<(String, AsyncPredicate)>,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Descriptor for a typed model: its declared fields, or fields inferred
    /// from its default value.
    pub fn from_model<T: EntityModel>() -> Self {
        let mut descriptor = Self::new(T::type_name()).fields(extract_fields::<T>());
        if let Some(table) = T::table_name() {
            descriptor = descriptor.table_name(table);
        }
        descriptor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name, def);
        self
    }

    pub fn fields(mut self, fields: FieldMap) -> Self {
        for (name, def) in fields.iter() {
            self.fields.insert(name, def.clone());
        }
        self
    }

    pub fn table_name(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    pub fn collection_initializer(mut self, init: CollectionInitializer) -> Self {
        self.collection_initializer = Some(init);
        self
    }

    pub fn before_delete(mut self, hook: Hook) -> Self {
        self.before_delete = Some(hook);
        self
    }

    pub fn after_delete(mut self, hook: Hook) -> Self {
        self.after_delete = Some(hook);
        self
    }

    pub fn async_validator(mut self, field: impl Into<String>, predicate: AsyncPredicate) -> Self {
        self.async_validators.push((field.into(), predicate));
        self
    }
}

/// Registered form of a type.
pub struct TypeMetadata {
    pub name: String,
    pub table_name: String,
    pub fields: FieldMap,
    pub schema: Arc<GeneratedSchema>,
    pub validators: Arc<Vec<Validator>>,
    pub(crate) collection_initializer: Option<CollectionInitializer>,
    pub(crate) before_delete: Option<Hook>,
    pub(crate) after_delete: Option<Hook>,
    async_validators: Vec<(String, AsyncPredicate)>,
    dialect: Dialect,
}

impl fmt::Debug for TypeMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMetadata")
            .field("name", &self.name)
            .field("table_name", &self.table_name)
            .field("fields", &self.fields.names())
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl TypeMetadata {
    fn build(descriptor: TypeDescriptor, dialect: Dialect) -> Result<Self> {
        let table_name = descriptor
            .table_name
            .clone()
            .unwrap_or_else(|| default_table_name(&descriptor.name));
        let schema =
            generate_for_table(&descriptor.name, &table_name, &descriptor.fields, dialect)?;
        let validators = validators::compile(&descriptor.fields, &descriptor.async_validators)?;

        Ok(Self {
            name: descriptor.name,
            table_name,
            fields: descriptor.fields,
            schema: Arc::new(schema),
            validators: Arc::new(validators),
            collection_initializer: descriptor.collection_initializer,
            before_delete: descriptor.before_delete,
            after_delete: descriptor.after_delete,
            async_validators: descriptor.async_validators,
            dialect,
        })
    }

    /// Schema for `dialect`; the cached one when it matches.
    pub fn schema_for(&self, dialect: Dialect) -> Result<Arc<GeneratedSchema>> {
        if dialect == self.dialect {
            return Ok(self.schema.clone());
        }
        generate_for_table(&self.name, &self.table_name, &self.fields, dialect).map(Arc::new)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }
}

type CellMap<K, V> = Mutex<HashMap<K, Arc<OnceCell<V>>>>;

pub struct Registry {
    config: RegistryConfig,
    dialect: Dialect,
    types: RwLock<BTreeMap<String, Arc<TypeMetadata>>>,
    system_tables: CellMap<String, ()>,
    tables: CellMap<(String, String), ()>,
    collections: CellMap<(String, String), Arc<CollectionShared>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("types", &self.registered_types())
            .finish()
    }
}

fn type_key(name: &str) -> String {
    name.to_lowercase()
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Arc<Self> {
        Self::for_backend(config, BackendKind::Sqlite)
    }

    /// Default settings with `saved`/`deleted` signals recorded or not.
    pub fn with_signal_log(enabled: bool) -> Arc<Self> {
        Self::with_config(RegistryConfig {
            signal_log: enabled,
            ..RegistryConfig::default()
        })
    }

    /// Registry whose cached schemas target `backend`.
    pub fn for_backend(config: RegistryConfig, backend: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            config,
            dialect: Dialect::from(backend),
            types: RwLock::new(BTreeMap::new()),
            system_tables: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
            collections: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Registers a type. Returns `false` when the name was already taken,
    /// in which case nothing changes.
    pub fn register(&self, descriptor: TypeDescriptor) -> Result<bool> {
        let key = type_key(descriptor.name());
        if descriptor.name().trim().is_empty() {
            return Err(PersistError::configuration(
                ErrorCode::InvalidConfig,
                "Type name cannot be empty",
            ));
        }

        if self.types.read()?.contains_key(&key) {
            event!(
                Level::TRACE,
                type_name = descriptor.name(),
                "Type already registered, skipping"
            );
            return Ok(false);
        }

        let metadata = Arc::new(TypeMetadata::build(descriptor, self.dialect)?);

        let mut types = self.types.write()?;
        if types.contains_key(&key) {
            event!(Level::TRACE, type_name = %metadata.name, "Type already registered, skipping");
            return Ok(false);
        }
        types.insert(key.clone(), metadata.clone());

        if let Err(err) = graph::initialization_order(&types) {
            types.remove(&key);
            return Err(err);
        }
        drop(types);

        event!(
            Level::DEBUG,
            type_name = %metadata.name,
            table = %metadata.table_name,
            field_count = metadata.fields.len(),
            validator_count = metadata.validators.len(),
            "Registered entity type"
        );
        Ok(true)
    }

    pub fn register_model<T: EntityModel>(&self) -> Result<bool> {
        self.register(TypeDescriptor::from_model::<T>())
    }

    /// Canonical names of every registered type, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        match self.types.read() {
            Ok(types) => {
                let mut names: Vec<String> = types.values().map(|m| m.name.clone()).collect();
                names.sort();
                names
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<Arc<TypeMetadata>> {
        self.types.read().ok()?.get(&type_key(name)).cloned()
    }

    pub fn schema(&self, name: &str) -> Option<Arc<GeneratedSchema>> {
        self.get(name).map(|meta| meta.schema.clone())
    }

    pub fn validators(&self, name: &str) -> Option<Arc<Vec<Validator>>> {
        self.get(name).map(|meta| meta.validators.clone())
    }

    pub fn fields(&self, name: &str) -> Option<FieldMap> {
        self.get(name).map(|meta| meta.fields.clone())
    }

    pub(crate) fn require(&self, name: &str) -> Result<Arc<TypeMetadata>> {
        self.get(name).ok_or_else(|| {
            PersistError::configuration(
                ErrorCode::UnknownType,
                format!("Entity type '{}' is not registered", name),
            )
            .with_detail("type_name", name)
        })
    }

    /// Rebuilds a type's schema and replaces the cached metadata.
    pub fn regenerate_schema(&self, name: &str) -> Result<Arc<GeneratedSchema>> {
        let key = type_key(name);
        let mut types = self.types.write()?;
        let current = types.get(&key).cloned().ok_or_else(|| {
            PersistError::configuration(
                ErrorCode::UnknownType,
                format!("Entity type '{}' is not registered", name),
            )
        })?;

        let schema = Arc::new(generate_for_table(
            &current.name,
            &current.table_name,
            &current.fields,
            self.dialect,
        )?);
        let rebuilt = TypeMetadata {
            name: current.name.clone(),
            table_name: current.table_name.clone(),
            fields: current.fields.clone(),
            schema: schema.clone(),
            validators: Arc::new(validators::compile(
                &current.fields,
                &current.async_validators,
            )?),
            collection_initializer: current.collection_initializer.clone(),
            before_delete: current.before_delete.clone(),
            after_delete: current.after_delete.clone(),
            async_validators: current.async_validators.clone(),
            dialect: self.dialect,
        };
        types.insert(key, Arc::new(rebuilt));
        Ok(schema)
    }

    /// Drops every type and cache.
    pub fn clear(&self) {
        if let Ok(mut types) = self.types.write() {
            types.clear();
        }
        if let Ok(mut cells) = self.system_tables.lock() {
            cells.clear();
        }
        if let Ok(mut cells) = self.tables.lock() {
            cells.clear();
        }
        if let Ok(mut cells) = self.collections.lock() {
            cells.clear();
        }
    }
}
