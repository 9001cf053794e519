//! Query and command façade for one entity type on one connection.

use crate::context::{COLLECTION_OWNER, ContextStore, MemoryRecord, RecallOptions, RememberOptions};
use crate::core::{ErrorCode, FieldKind, PersistError, Record, Result, Value};
use crate::entity::{Entity, RelationSlot};
use crate::model::EntityModel;
use crate::query::{
    Filter, FilterExpr, ListOptions, OrderBy, WhereClause, build_order_by, build_where,
    looks_like_id,
};
use crate::registry::{Registry, Relationship, TypeMetadata};
use crate::schema::GeneratedSchema;
use crate::session::PersistSession;
use futures::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// State shared by every handle on the same `(type, connection)`.
#[derive(Debug)]
pub struct CollectionShared {
    pub(crate) schema: Arc<GeneratedSchema>,
    pub(crate) connection_key: String,
    pub(crate) context_table: String,
}

impl CollectionShared {
    pub(crate) fn new(
        schema: Arc<GeneratedSchema>,
        connection_key: &str,
        context_table: String,
    ) -> Self {
        Self {
            schema,
            connection_key: connection_key.to_string(),
            context_table,
        }
    }
}

/// How [`Collection::get`] finds a single entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Id(String),
    SlugContext { slug: String, context: String },
    /// Raw value of the key column (the declared primary key, or `id`).
    Key(Value),
    Filter(Filter),
}

impl From<&str> for Lookup {
    /// UUID-shaped strings are ids; anything else is a slug in the default context.
    fn from(raw: &str) -> Self {
        if looks_like_id(raw) {
            Lookup::Id(raw.to_string())
        } else {
            Lookup::SlugContext {
                slug: raw.to_string(),
                context: String::new(),
            }
        }
    }
}

impl From<String> for Lookup {
    fn from(raw: String) -> Self {
        Lookup::from(raw.as_str())
    }
}

impl From<(&str, &str)> for Lookup {
    fn from((slug, context): (&str, &str)) -> Self {
        Lookup::SlugContext {
            slug: slug.to_string(),
            context: context.to_string(),
        }
    }
}

impl From<Filter> for Lookup {
    fn from(filter: Filter) -> Self {
        Lookup::Filter(filter)
    }
}

#[derive(Clone)]
pub struct Collection {
    registry: Arc<Registry>,
    meta: Arc<TypeMetadata>,
    shared: Arc<CollectionShared>,
    session: PersistSession,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("type_name", &self.meta.name)
            .field("table", &self.shared.schema.table_name)
            .field("connection", &self.shared.connection_key)
            .finish()
    }
}

fn where_sql(clause: &WhereClause) -> String {
    if clause.sql.is_empty() {
        String::new()
    } else {
        format!(" {}", clause.sql)
    }
}

impl Collection {
    pub(crate) fn new(
        registry: Arc<Registry>,
        meta: Arc<TypeMetadata>,
        shared: Arc<CollectionShared>,
        session: PersistSession,
    ) -> Self {
        Self {
            registry,
            meta,
            shared,
            session,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.meta.name
    }

    pub fn metadata(&self) -> &Arc<TypeMetadata> {
        &self.meta
    }

    pub fn schema(&self) -> &Arc<GeneratedSchema> {
        &self.shared.schema
    }

    pub fn session(&self) -> &PersistSession {
        &self.session
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Same collection, issuing statements through `session` (typically a
    /// transaction handle on the same connection).
    pub fn with_session(&self, session: PersistSession) -> Self {
        Self {
            session,
            ..self.clone()
        }
    }

    /// True when both handles share the state built for one `(type, connection)`.
    pub fn same_instance(&self, other: &Collection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn hydrate(&self, row: Record) -> Entity {
        Entity::from_row(
            self.registry.clone(),
            self.meta.clone(),
            &self.shared,
            self.session.clone(),
            row,
        )
    }

    async fn select(
        &self,
        filter: &Filter,
        order: &[OrderBy],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Record>> {
        let dialect = self.session.dialect();
        let clause = build_where(filter, dialect, 1)?;
        let sql = format!(
            "SELECT * FROM {}{}{}{}",
            dialect.quote_ident(&self.shared.schema.table_name),
            where_sql(&clause),
            build_order_by(order, dialect)?,
            dialect.limit_clause(limit, offset)
        );
        Ok(self.session.query(&sql, &clause.params).await?.rows)
    }

    fn key_from_str(&self, raw: &str) -> Value {
        let kind = self
            .shared
            .schema
            .primary_key
            .as_deref()
            .and_then(|pk| self.meta.field(pk))
            .map(|def| def.kind);
        match (kind, raw.parse::<i64>()) {
            (Some(FieldKind::Integer), Ok(n)) => Value::Integer(n),
            _ => Value::Text(raw.to_string()),
        }
    }

    fn lookup_filter(&self, lookup: Lookup) -> Filter {
        let schema = &self.shared.schema;
        let key = schema.key_column();
        if !schema.uses_default_identity() {
            return match lookup {
                Lookup::Filter(filter) => filter,
                Lookup::Key(value) => Filter::new().eq(key, value),
                Lookup::Id(raw) | Lookup::SlugContext { slug: raw, .. } => {
                    Filter::new().eq(key, self.key_from_str(&raw))
                }
            };
        }
        match lookup {
            Lookup::Filter(filter) => filter,
            Lookup::Key(value) => Filter::new().eq(key, value),
            Lookup::Id(id) => Filter::new().eq("id", id),
            Lookup::SlugContext { slug, context } => {
                Filter::new().eq("slug", slug).eq("context", context)
            }
        }
    }

    /// One entity matching `lookup`, if any.
    pub async fn get(&self, lookup: impl Into<Lookup>) -> Result<Option<Entity>> {
        let filter = self.lookup_filter(lookup.into());
        let mut rows = self.select(&filter, &[], Some(1), None).await?;
        Ok(rows.pop().map(|row| self.hydrate(row)))
    }

    pub(crate) async fn find_by_key(&self, key: &str) -> Result<Option<Entity>> {
        let value = match self.shared.schema.primary_key {
            Some(_) => self.key_from_str(key),
            None => Value::from(key),
        };
        self.get(Lookup::Key(value)).await
    }

    /// Filtered, ordered, paginated entities with the requested
    /// relationships eager-loaded in one query per include.
    pub async fn list(&self, options: ListOptions) -> Result<Vec<Entity>> {
        let includes = self.resolve_includes(&options.include)?;
        let rows = self
            .select(&options.filter, &options.order_by, options.limit, options.offset)
            .await?;
        let mut entities: Vec<Entity> = rows.into_iter().map(|row| self.hydrate(row)).collect();

        if !includes.is_empty() && !entities.is_empty() {
            self.eager_load(&mut entities, &includes).await?;
        }
        Ok(entities)
    }

    fn resolve_includes(&self, include: &[String]) -> Result<Vec<Relationship>> {
        let mut seen = HashSet::new();
        include
            .iter()
            .filter(|field| seen.insert(field.as_str()))
            .map(|field| self.registry.relationship(&self.meta.name, field))
            .collect()
    }

    async fn eager_load(&self, entities: &mut [Entity], includes: &[Relationship]) -> Result<()> {
        let view: &[Entity] = entities;
        let batches = try_join_all(includes.iter().map(|rel| self.batch_load(rel, view))).await?;

        for (rel, slots) in includes.iter().zip(batches) {
            let Some(slots) = slots else {
                continue;
            };
            for (entity, slot) in entities.iter_mut().zip(slots) {
                entity.set_slot(&rel.field_name, slot);
            }
        }
        Ok(())
    }

    /// Slots for one include, aligned with `entities`; `None` leaves them
    /// untouched.
    async fn batch_load(
        &self,
        rel: &Relationship,
        entities: &[Entity],
    ) -> Result<Option<Vec<RelationSlot>>> {
        match rel.kind {
            FieldKind::ForeignKey => {
                let keys = distinct_keys(
                    entities
                        .iter()
                        .filter_map(|e| e.fields().get(&rel.field_name).cloned()),
                );
                if keys.is_empty() {
                    return Ok(Some(vec![RelationSlot::Loaded(None); entities.len()]));
                }

                let target = self
                    .registry
                    .get_or_create_collection(&rel.target_type, &self.session)
                    .await?;
                let filter = Filter::new().push(target.schema().key_column(), FilterExpr::In(keys));
                let by_key: HashMap<String, Entity> = target
                    .select(&filter, &[], None, None)
                    .await?
                    .into_iter()
                    .map(|row| target.hydrate(row))
                    .filter_map(|entity| entity.id().map(|key| (key, entity)))
                    .collect();

                Ok(Some(
                    entities
                        .iter()
                        .map(|entity| {
                            let hit = entity
                                .fields()
                                .get(&rel.field_name)
                                .and_then(Value::key_string)
                                .and_then(|key| by_key.get(&key))
                                .cloned();
                            RelationSlot::Loaded(hit.map(Box::new))
                        })
                        .collect(),
                ))
            }
            FieldKind::OneToMany => {
                let inverse = self
                    .registry
                    .inverse_foreign_key(&self.meta.name, &rel.target_type)
                    .ok_or_else(|| missing_inverse(&self.meta.name, rel))?;
                let ids = distinct_keys(entities.iter().map(Entity::key_value));
                if ids.is_empty() {
                    return Ok(Some(vec![RelationSlot::LoadedMany(Vec::new()); entities.len()]));
                }

                let target = self
                    .registry
                    .get_or_create_collection(&rel.target_type, &self.session)
                    .await?;
                let filter = Filter::new().push(inverse.field_name.as_str(), FilterExpr::In(ids));
                let mut groups: HashMap<String, Vec<Entity>> = HashMap::new();
                for row in target.select(&filter, &[], None, None).await? {
                    let child = target.hydrate(row);
                    let parent = child
                        .fields()
                        .get(&inverse.field_name)
                        .and_then(Value::key_string);
                    if let Some(parent) = parent {
                        groups.entry(parent).or_default().push(child);
                    }
                }

                Ok(Some(
                    entities
                        .iter()
                        .map(|entity| {
                            let children = entity
                                .id()
                                .and_then(|id| groups.get(&id))
                                .cloned()
                                .unwrap_or_default();
                            RelationSlot::LoadedMany(children)
                        })
                        .collect(),
                ))
            }
            other => {
                log::warn!(
                    "Eager loading of {} relationship '{}.{}' is not supported; the include was skipped",
                    other,
                    self.meta.name,
                    rel.field_name
                );
                Ok(None)
            }
        }
    }

    /// Number of entities matching the filter; pagination and order are ignored.
    pub async fn count(&self, options: ListOptions) -> Result<u64> {
        let dialect = self.session.dialect();
        let clause = build_where(&options.filter, dialect, 1)?;
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {}{}",
            dialect.quote_ident(&self.shared.schema.table_name),
            where_sql(&clause)
        );
        let result = self.session.query(&sql, &clause.params).await?;
        Ok(result
            .scalar()
            .and_then(Value::as_i64)
            .map(|n| n.max(0) as u64)
            .unwrap_or(0))
    }

    /// An unsaved instance seeded with `data`.
    pub fn build(&self, data: Record) -> Result<Entity> {
        let mut entity = Entity::new(
            self.registry.clone(),
            self.meta.clone(),
            &self.shared,
            self.session.clone(),
        );
        entity.apply(data)?;
        Ok(entity)
    }

    /// Seeds an instance and loads its stored row, if one exists.
    pub async fn load(&self, data: Record) -> Result<Entity> {
        let mut entity = self.build(data)?;
        entity.initialize().await?;
        Ok(entity)
    }

    /// A new, unsaved instance. No lookup is attempted.
    pub async fn create(&self, data: Record) -> Result<Entity> {
        let mut entity = self.build(data)?;
        entity.initialize_with(true).await?;
        Ok(entity)
    }

    /// Creates and saves in one step.
    pub async fn insert(&self, data: Record) -> Result<Entity> {
        let mut entity = self.create(data).await?;
        entity.save().await?;
        Ok(entity)
    }

    /// A new instance from a typed model. Keys with a leading underscore
    /// are skipped.
    pub async fn from_model<T: EntityModel>(&self, model: &T) -> Result<Entity> {
        self.create(record_from_model(model)?).await
    }

    fn identity_lookup(&self, data: &Record) -> Lookup {
        let schema = &self.shared.schema;
        if schema.uses_default_identity() {
            if let Some(id) = data.get("id").and_then(Value::key_string) {
                return Lookup::Id(id);
            }
            if let Some(slug) = data.get("slug").and_then(Value::key_string) {
                let context = data
                    .get("context")
                    .and_then(Value::key_string)
                    .unwrap_or_default();
                return Lookup::SlugContext { slug, context };
            }
        } else if let Some(key) = data.get(schema.key_column()).filter(|v| !v.is_blank()) {
            return Lookup::Key(key.clone());
        }
        Lookup::Filter(Filter::matching(data))
    }

    /// Finds the entity identified by `data` and applies changed declared
    /// fields, or creates one from `defaults` overlaid with `data`.
    pub async fn get_or_upsert(&self, data: Record, defaults: Record) -> Result<Entity> {
        let existing = if data.is_empty() {
            None
        } else {
            self.get(self.identity_lookup(&data)).await?
        };

        let Some(mut entity) = existing else {
            let mut merged = defaults;
            merged.extend(data);
            let mut entity = self.create(merged).await?;
            entity.save().await?;
            return Ok(entity);
        };

        let mut changed = false;
        for (field, value) in &data {
            let Some(def) = self.meta.field(field) else {
                continue;
            };
            if !def.kind.is_column() || def.options.primary_key {
                continue;
            }
            let value = value.clone().coerce(def.kind);
            if entity.get(field).unwrap_or(Value::Null) != value {
                entity.set(field, value)?;
                changed = true;
            }
        }
        if changed {
            entity.save().await?;
        }
        Ok(entity)
    }

    /// Memory owned by the collection as a whole.
    pub fn memory(&self) -> ContextStore {
        ContextStore::new(
            self.session.clone(),
            self.shared.context_table.clone(),
            self.meta.name.clone(),
            COLLECTION_OWNER,
        )
    }

    pub async fn remember(
        &self,
        key: &str,
        value: serde_json::Value,
        options: RememberOptions,
    ) -> Result<MemoryRecord> {
        self.memory().remember(key, value, options).await
    }

    pub async fn recall(&self, key: &str, options: RecallOptions) -> Result<Option<MemoryRecord>> {
        self.memory().recall(key, options).await
    }

    pub async fn recall_all(&self, scope: &str) -> Result<Vec<MemoryRecord>> {
        self.memory().recall_all(scope).await
    }

    pub async fn forget(&self, key: &str, scope: &str) -> Result<bool> {
        self.memory().forget(key, scope).await
    }

    pub async fn forget_scope(&self, scope: &str) -> Result<u64> {
        self.memory().forget_scope(scope).await
    }
}

fn distinct_keys(values: impl Iterator<Item = Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    values
        .filter(|value| value.key_string().is_some_and(|key| seen.insert(key)))
        .collect()
}

fn missing_inverse(type_name: &str, rel: &Relationship) -> PersistError {
    PersistError::configuration(
        ErrorCode::MissingInverse,
        format!(
            "'{}.{}' needs a foreign key on '{}' pointing back at '{}'",
            type_name, rel.field_name, rel.target_type, type_name
        ),
    )
    .with_detail("type_name", type_name)
    .with_detail("field", &rel.field_name)
}

/// Serializes a model into a record, dropping `_`-prefixed keys.
pub fn record_from_model<T: EntityModel>(model: &T) -> Result<Record> {
    match serde_json::to_value(model)? {
        serde_json::Value::Object(object) => Ok(object
            .into_iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .map(|(key, value)| (key, Value::from_json(value)))
            .collect()),
        other => Err(PersistError::runtime(
            ErrorCode::InvalidState,
            format!("{} did not serialize to an object: {}", T::type_name(), other),
        )),
    }
}
