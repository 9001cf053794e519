use super::{Entity, RelationSlot};
use crate::core::{ErrorCode, FieldKind, PersistError, Result, Value};
use crate::query::{Filter, ListOptions};

impl Entity {
    /// Resolves a foreign-key field, caching the result on this instance.
    ///
    /// A null key caches `None` without touching storage; so does a key
    /// whose target row is gone.
    pub async fn load_related(&mut self, field: &str) -> Result<Option<Entity>> {
        if let Some(RelationSlot::Loaded(cached)) = self.relations.get(field) {
            return Ok(cached.as_deref().cloned());
        }

        let relationship = self.registry.relationship(&self.meta.name, field)?;
        if relationship.kind != FieldKind::ForeignKey {
            return Err(PersistError::configuration(
                ErrorCode::UnknownRelationship,
                format!(
                    "'{}.{}' is a {} relationship; use load_related_many",
                    self.meta.name, field, relationship.kind
                ),
            ));
        }

        let Some(key) = self.fields.get(field).and_then(Value::key_string) else {
            self.set_slot(field, RelationSlot::Loaded(None));
            return Ok(None);
        };

        let target = self
            .registry
            .get_or_create_collection(&relationship.target_type, &self.session)
            .await?;
        let found = target.find_by_key(&key).await?;
        self.set_slot(field, RelationSlot::Loaded(found.clone().map(Box::new)));
        Ok(found)
    }

    /// Resolves a one-to-many field through the inverse foreign key on the
    /// target type, caching the result on this instance.
    pub async fn load_related_many(&mut self, field: &str) -> Result<Vec<Entity>> {
        if let Some(RelationSlot::LoadedMany(cached)) = self.relations.get(field) {
            return Ok(cached.clone());
        }

        let relationship = self.registry.relationship(&self.meta.name, field)?;
        match relationship.kind {
            FieldKind::OneToMany => {}
            FieldKind::ManyToMany => {
                return Err(PersistError::runtime(
                    ErrorCode::Unsupported,
                    format!(
                        "'{}.{}': many-to-many relationships cannot be loaded",
                        self.meta.name, field
                    ),
                ));
            }
            other => {
                return Err(PersistError::configuration(
                    ErrorCode::UnknownRelationship,
                    format!(
                        "'{}.{}' is a {} relationship; use load_related",
                        self.meta.name, field, other
                    ),
                ));
            }
        }

        let inverse = self
            .registry
            .inverse_foreign_key(&self.meta.name, &relationship.target_type)
            .ok_or_else(|| {
                PersistError::configuration(
                    ErrorCode::MissingInverse,
                    format!(
                        "'{}.{}' needs a foreign key on '{}' pointing back at '{}'",
                        self.meta.name, field, relationship.target_type, self.meta.name
                    ),
                )
                .with_detail("type_name", &self.meta.name)
                .with_detail("field", field)
                .with_detail("target_type", &relationship.target_type)
            })?;

        if self.id().is_none() {
            return Err(self.missing_identity("load related entities"));
        }

        let target = self
            .registry
            .get_or_create_collection(&relationship.target_type, &self.session)
            .await?;
        let items = target
            .list(ListOptions::new().filter(Filter::new().eq(inverse.field_name, self.key_value())))
            .await?;
        self.set_slot(field, RelationSlot::LoadedMany(items.clone()));
        Ok(items)
    }

    /// Cached value of any relationship field, if loaded.
    pub fn related(&self, field: &str) -> Option<&RelationSlot> {
        match self.relations.get(field) {
            Some(RelationSlot::Unloaded) | None => None,
            Some(slot) => Some(slot),
        }
    }
}
