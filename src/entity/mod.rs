//! Runtime instances of registered types.
//!
//! An [`Entity`] is a dynamic record bound to its type metadata, the
//! registry that produced it and the session it reads and writes through.
//! Identity lives in `id` (or the declared primary key), with `(slug,
//! context)` as the secondary uniqueness pair in default identity mode.

mod lifecycle;
mod relations;

pub use lifecycle::translate_constraint_error;

use crate::collection::CollectionShared;
use crate::context::{ContextStore, MemoryRecord, RecallOptions, RememberOptions};
use crate::core::types::{is_created_at, is_updated_at};
use crate::core::{ErrorCode, FieldKind, PersistError, Record, Result, ValidationError, Value};
use crate::registry::{Registry, TypeMetadata};
use crate::schema::GeneratedSchema;
use crate::session::PersistSession;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Where an instance is in its lifecycle. Unsaved mutations are tracked
/// separately by [`Entity::is_dirty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Constructed,
    Loaded,
    New,
    Saved,
    Failed,
    Deleted,
}

/// Cached result of resolving one relationship field.
#[derive(Debug, Clone)]
pub enum RelationSlot {
    Unloaded,
    Loaded(Option<Box<Entity>>),
    LoadedMany(Vec<Entity>),
}

#[derive(Clone)]
pub struct Entity {
    meta: Arc<TypeMetadata>,
    registry: Arc<Registry>,
    session: PersistSession,
    schema: Arc<GeneratedSchema>,
    context_table: String,
    id: Option<String>,
    slug: Option<String>,
    context: String,
    name: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    fields: Record,
    relations: BTreeMap<String, RelationSlot>,
    state: EntityState,
    dirty: bool,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("type_name", &self.meta.name)
            .field("id", &self.id())
            .field("slug", &self.slug)
            .field("context", &self.context)
            .field("fields", &self.fields)
            .field("state", &self.state)
            .finish()
    }
}

impl Entity {
    pub(crate) fn new(
        registry: Arc<Registry>,
        meta: Arc<TypeMetadata>,
        shared: &CollectionShared,
        session: PersistSession,
    ) -> Self {
        let relations = meta
            .fields
            .relationship_fields()
            .map(|(field, _)| (field.to_string(), RelationSlot::Unloaded))
            .collect();
        let fields = meta
            .fields
            .iter()
            .filter(|(_, def)| def.kind.is_column())
            .filter_map(|(field, def)| {
                let default = def.options.default.clone()?;
                Some((field.to_string(), default.coerce(def.kind)))
            })
            .collect();

        Self {
            meta,
            registry,
            session,
            schema: shared.schema.clone(),
            context_table: shared.context_table.clone(),
            id: None,
            slug: None,
            context: String::new(),
            name: None,
            created_at: None,
            updated_at: None,
            fields,
            relations,
            state: EntityState::Constructed,
            dirty: false,
        }
    }

    /// Builds an instance from a stored row. Unknown columns are ignored.
    pub(crate) fn from_row(
        registry: Arc<Registry>,
        meta: Arc<TypeMetadata>,
        shared: &CollectionShared,
        session: PersistSession,
        row: Record,
    ) -> Self {
        let mut entity = Self::new(registry, meta, shared, session);
        entity.hydrate(row);
        entity.state = EntityState::Loaded;
        entity
    }

    fn hydrate(&mut self, row: Record) {
        let default_identity = self.schema.uses_default_identity();
        for (column, value) in row {
            match column.as_str() {
                "id" if default_identity => self.id = value.key_string(),
                "slug" if default_identity => self.slug = value.key_string(),
                "context" if default_identity => {
                    self.context = value.key_string().unwrap_or_default()
                }
                "name" if default_identity => self.name = value.key_string(),
                c if is_created_at(c) => self.created_at = value.as_timestamp(),
                c if is_updated_at(c) => self.updated_at = value.as_timestamp(),
                c => {
                    if let Some(def) = self.meta.fields.get(c).filter(|d| d.kind.is_column()) {
                        self.fields.insert(column.clone(), value.coerce(def.kind));
                    }
                }
            }
        }
    }

    pub fn type_name(&self) -> &str {
        &self.meta.name
    }

    pub fn metadata(&self) -> &Arc<TypeMetadata> {
        &self.meta
    }

    pub fn schema(&self) -> &Arc<GeneratedSchema> {
        &self.schema
    }

    pub fn session(&self) -> &PersistSession {
        &self.session
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The row identity: `id`, or the declared primary key rendered as text.
    pub fn id(&self) -> Option<String> {
        match &self.schema.primary_key {
            None => self.id.clone(),
            Some(pk) => self.fields.get(pk).and_then(Value::key_string),
        }
    }

    pub(crate) fn key_value(&self) -> Value {
        match &self.schema.primary_key {
            None => self.id.clone().map(Value::Text).unwrap_or(Value::Null),
            Some(pk) => self.fields.get(pk).cloned().unwrap_or(Value::Null),
        }
    }

    pub fn slug(&self) -> Option<&str> {
        self.slug.as_deref()
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Declared field values, excluding the identity and timestamp columns.
    pub fn fields(&self) -> &Record {
        &self.fields
    }

    /// Reads a base attribute or declared field.
    pub fn get(&self, field: &str) -> Option<Value> {
        let default_identity = self.schema.uses_default_identity();
        match field {
            "id" => self.id().map(Value::Text),
            "slug" if default_identity => self.slug.clone().map(Value::Text),
            "context" if default_identity => Some(Value::Text(self.context.clone())),
            "name" if default_identity => self.name.clone().map(Value::Text),
            f if is_created_at(f) => self.created_at.map(Value::Timestamp),
            f if is_updated_at(f) => self.updated_at.map(Value::Timestamp),
            f => self.fields.get(f).cloned(),
        }
    }

    pub(crate) fn value_of(&self, field: &str) -> Value {
        self.get(field).unwrap_or(Value::Null)
    }

    /// Writes a base attribute or declared field and marks the entity dirty.
    ///
    /// Changing a foreign key drops whatever was cached for it.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let default_identity = self.schema.uses_default_identity();

        match field {
            "id" => return self.set_identity(value),
            "slug" if default_identity => self.slug = value.key_string(),
            "context" if default_identity => self.context = value.key_string().unwrap_or_default(),
            "name" if default_identity => self.name = value.key_string(),
            f if is_created_at(f) => self.created_at = timestamp_value(f, value)?,
            f if is_updated_at(f) => self.updated_at = timestamp_value(f, value)?,
            f => {
                let (kind, primary_key) = match self.meta.fields.get(f) {
                    Some(def) => (def.kind, def.options.primary_key),
                    None => {
                        return Err(PersistError::configuration(
                            ErrorCode::UnknownField,
                            format!("'{}' has no field '{}'", self.meta.name, f),
                        )
                        .with_detail("type_name", &self.meta.name)
                        .with_detail("field", f));
                    }
                };
                if !kind.is_column() {
                    return Err(PersistError::runtime(
                        ErrorCode::Unsupported,
                        format!(
                            "'{}.{}' is a collection relationship and cannot be assigned",
                            self.meta.name, f
                        ),
                    ));
                }
                if primary_key {
                    return self.set_identity(value);
                }
                self.fields.insert(f.to_string(), value.coerce(kind));
                if kind == FieldKind::ForeignKey {
                    self.relations.insert(f.to_string(), RelationSlot::Unloaded);
                }
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Assigns the identity. Blank, `"null"` and `"undefined"` are rejected;
    /// once set, the identity cannot change.
    pub fn set_id(&mut self, id: &str) -> Result<()> {
        self.set_identity(Value::from(id))
    }

    fn set_identity(&mut self, value: Value) -> Result<()> {
        let field = self.schema.key_column().to_string();
        let raw = value
            .key_string()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && s != "null" && s != "undefined");
        let Some(raw) = raw else {
            return Err(PersistError::validation(
                ErrorCode::InvalidIdentity,
                ValidationError::new(field.as_str(), "identity", "Identity cannot be empty")
                    .with_value(value),
            ));
        };

        if let Some(current) = self.id() {
            if current == raw {
                return Ok(());
            }
            return Err(PersistError::runtime(
                ErrorCode::ImmutableIdentity,
                format!(
                    "Cannot change identity of '{}' from '{}' to '{}'",
                    self.meta.name, current, raw
                ),
            )
            .with_detail("type_name", &self.meta.name));
        }

        match &self.schema.primary_key {
            None => self.id = Some(raw),
            Some(pk) => {
                let kind = self.meta.field(pk).map(|d| d.kind).unwrap_or(FieldKind::Text);
                let stored = match kind {
                    FieldKind::Integer => Value::Integer(raw.parse::<i64>().map_err(|_| {
                        PersistError::validation(
                            ErrorCode::InvalidIdentity,
                            ValidationError::new(
                                pk.as_str(),
                                "identity",
                                "Identity must be an integer",
                            )
                            .with_value(Value::Text(raw.clone())),
                        )
                    })?),
                    other => Value::Text(raw).coerce(other),
                };
                self.fields.insert(pk.clone(), stored);
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Applies caller data as on construction: blank identities are skipped.
    pub(crate) fn apply(&mut self, data: Record) -> Result<()> {
        let key = self.schema.key_column().to_string();
        for (field, value) in data {
            if (field == "id" || field == key) && value.is_blank() {
                continue;
            }
            self.set(&field, value)?;
        }
        Ok(())
    }

    pub fn relation(&self, field: &str) -> Option<&RelationSlot> {
        self.relations.get(field)
    }

    /// Cached single relation; `None` when unloaded or empty.
    pub fn related_one(&self, field: &str) -> Option<&Entity> {
        match self.relations.get(field) {
            Some(RelationSlot::Loaded(Some(entity))) => Some(entity),
            _ => None,
        }
    }

    /// Cached collection relation; `None` when unloaded.
    pub fn related_many(&self, field: &str) -> Option<&[Entity]> {
        match self.relations.get(field) {
            Some(RelationSlot::LoadedMany(items)) => Some(items),
            _ => None,
        }
    }

    pub(crate) fn set_slot(&mut self, field: &str, slot: RelationSlot) {
        if let Some(existing) = self.relations.get_mut(field) {
            *existing = slot;
        }
    }

    /// Base attributes and declared fields as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        if self.schema.uses_default_identity() {
            object.insert("id".into(), self.id.clone().into());
            object.insert("slug".into(), self.slug.clone().into());
            object.insert("context".into(), self.context.clone().into());
            object.insert("name".into(), self.name.clone().into());
        }
        for (field, value) in &self.fields {
            object.insert(field.clone(), value.to_json());
        }
        object.insert(
            "created_at".into(),
            self.get("created_at").map(|v| v.to_json()).unwrap_or_default(),
        );
        object.insert(
            "updated_at".into(),
            self.get("updated_at").map(|v| v.to_json()).unwrap_or_default(),
        );
        serde_json::Value::Object(object)
    }

    /// Deserializes into a typed model. Extra attributes are ignored unless
    /// the model denies unknown fields.
    pub fn to_model<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }

    /// Memory owned by this instance. Requires an identity.
    pub fn memory(&self) -> Result<ContextStore> {
        let owner = self.id().ok_or_else(|| self.missing_identity("use context memory"))?;
        Ok(ContextStore::new(
            self.session.clone(),
            self.context_table.clone(),
            self.meta.name.clone(),
            owner,
        ))
    }

    pub async fn remember(
        &self,
        key: &str,
        value: serde_json::Value,
        options: RememberOptions,
    ) -> Result<MemoryRecord> {
        self.memory()?.remember(key, value, options).await
    }

    pub async fn recall(&self, key: &str, options: RecallOptions) -> Result<Option<MemoryRecord>> {
        self.memory()?.recall(key, options).await
    }

    pub async fn recall_all(&self, scope: &str) -> Result<Vec<MemoryRecord>> {
        self.memory()?.recall_all(scope).await
    }

    pub async fn forget(&self, key: &str, scope: &str) -> Result<bool> {
        self.memory()?.forget(key, scope).await
    }

    pub async fn forget_scope(&self, scope: &str) -> Result<u64> {
        self.memory()?.forget_scope(scope).await
    }

    pub(crate) fn missing_identity(&self, action: &str) -> PersistError {
        PersistError::runtime(
            ErrorCode::MissingIdentity,
            format!("Cannot {} on '{}' without an identity", action, self.meta.name),
        )
        .with_detail("type_name", &self.meta.name)
    }
}

fn timestamp_value(field: &str, value: Value) -> Result<Option<DateTime<Utc>>> {
    if value.is_null() {
        return Ok(None);
    }
    match value.as_timestamp() {
        Some(ts) => Ok(Some(ts)),
        None => Err(PersistError::validation(
            ErrorCode::Custom,
            ValidationError::new(field, "datetime", format!("{} is not a timestamp", field))
                .with_value(value),
        )),
    }
}
