use super::{Entity, EntityState};
use crate::core::types::{is_created_at, is_updated_at};
use crate::core::{ErrorCode, PersistError, Record, Result, ValidationError, Value};
use crate::query::{Filter, build_where};
use crate::registry::validators;
use crate::schema::{DEFAULT_IDENTITY_COLUMNS, new_entity_id, slugify};
use crate::storage::Dialect;
use chrono::{SubsecRound, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

lazy_static! {
    static ref SQLITE_CONSTRAINT: Regex =
        Regex::new(r"(?:UNIQUE|NOT NULL) constraint failed: (?:\w+\.)?(\w+)").unwrap();
    static ref POSTGRES_KEY: Regex = Regex::new(r"Key \(([^)=,\s]+)").unwrap();
    static ref POSTGRES_NOT_NULL: Regex = Regex::new(r#"null value in column "([^"]+)""#).unwrap();
    static ref DUCKDB_KEY: Regex = Regex::new(r#"Duplicate key "(\w+):"#).unwrap();
}

const UNKNOWN_FIELD: &str = "unknown_field";

fn constraint_column(dialect: Dialect, message: &str) -> Option<String> {
    let patterns: Vec<&Regex> = match dialect {
        Dialect::Sqlite => vec![&*SQLITE_CONSTRAINT],
        Dialect::Postgres => vec![&*POSTGRES_KEY, &*POSTGRES_NOT_NULL],
        Dialect::DuckDb => vec![&*DUCKDB_KEY, &*POSTGRES_NOT_NULL],
    };
    patterns
        .iter()
        .find_map(|re| re.captures(message))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Turns a backend unique/not-null violation into a validation error naming
/// the offending column. Other errors pass through untouched.
pub fn translate_constraint_error(
    err: PersistError,
    dialect: Dialect,
    row: &Record,
) -> PersistError {
    if !err.code().is_constraint() {
        return err;
    }

    let message = err.message();
    let not_null = err.code() == ErrorCode::NotNullViolation
        || message.contains("NOT NULL")
        || message.contains("null value");
    let (code, constraint) = if not_null {
        (ErrorCode::NotNullViolation, "notNull")
    } else {
        (ErrorCode::UniqueViolation, "unique")
    };

    let field = constraint_column(dialect, &message).unwrap_or_else(|| UNKNOWN_FIELD.to_string());
    let mut error = ValidationError::new(
        field.as_str(),
        constraint,
        if not_null {
            format!("{} cannot be null", field)
        } else {
            format!("{} must be unique", field)
        },
    );
    if let Some(value) = row.get(&field) {
        error = error.with_value(value.clone());
    }

    PersistError::Validation {
        code,
        error,
        source: Some(Box::new(err)),
    }
}

impl Entity {
    pub(crate) fn key_filter(&self) -> Filter {
        Filter::new().eq(self.schema.key_column(), self.key_value())
    }

    async fn fetch_row(&self, filter: &Filter) -> Result<Option<Record>> {
        let dialect = self.session.dialect();
        let clause = build_where(filter, dialect, 1)?;
        let sql = format!(
            "SELECT * FROM {} {}{}",
            dialect.quote_ident(&self.schema.table_name),
            clause.sql,
            dialect.limit_clause(Some(1), None)
        );
        let result = self.session.query(&sql, &clause.params).await?;
        Ok(result.rows.into_iter().next())
    }

    /// Loads the stored row by identity, else by `(slug, context)`.
    /// Stored values replace any seeded ones.
    pub async fn initialize(&mut self) -> Result<()> {
        self.initialize_with(false).await
    }

    pub(crate) async fn initialize_with(&mut self, skip_load: bool) -> Result<()> {
        if skip_load {
            self.state = EntityState::New;
            return Ok(());
        }

        let filter = if self.id().is_some() {
            Some(self.key_filter())
        } else if let (true, Some(slug)) = (self.schema.uses_default_identity(), &self.slug) {
            Some(
                Filter::new()
                    .eq("slug", slug.as_str())
                    .eq("context", self.context.as_str()),
            )
        } else {
            None
        };

        let row = match filter {
            Some(filter) => self.fetch_row(&filter).await?,
            None => None,
        };
        match row {
            Some(row) => {
                self.hydrate(row);
                self.state = EntityState::Loaded;
                self.dirty = false;
            }
            None => self.state = EntityState::New,
        }
        Ok(())
    }

    /// Reloads the stored row. Returns `false` when it no longer exists.
    pub async fn refresh(&mut self) -> Result<bool> {
        if self.id().is_none() {
            return Err(self.missing_identity("refresh"));
        }
        match self.fetch_row(&self.key_filter()).await? {
            Some(row) => {
                self.hydrate(row);
                for slot in self.relations.values_mut() {
                    *slot = super::RelationSlot::Unloaded;
                }
                self.state = EntityState::Loaded;
                self.dirty = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn validate(&self) -> Result<()> {
        if self.meta.validators.is_empty() {
            return validators::required_scan(&self.meta.fields, |field| self.value_of(field));
        }
        validators::run(&self.meta.validators, |field| self.value_of(field)).await
    }

    fn assign_identity(&mut self) -> Result<()> {
        if self.id().is_some() {
            return Ok(());
        }
        if self.schema.uses_default_identity() {
            self.id = Some(new_entity_id());
            return Ok(());
        }
        let key = self.schema.key_column().to_string();
        Err(PersistError::validation(
            ErrorCode::Required,
            ValidationError::new(key.as_str(), "required", format!("{} is required", key))
                .with_value(Value::Null),
        ))
    }

    fn assign_slug(&mut self) {
        if !self.schema.uses_default_identity() || self.slug.is_some() {
            return;
        }
        let from_name = self.name.as_deref().map(slugify).filter(|s| !s.is_empty());
        self.slug = from_name.or_else(|| self.id.clone());
    }

    fn to_row(&self) -> Record {
        let mut row = Record::new();
        if self.schema.uses_default_identity() {
            row.insert("id".into(), self.key_value());
            row.insert(
                "slug".into(),
                self.slug.clone().map(Value::Text).unwrap_or(Value::Null),
            );
            row.insert("context".into(), Value::Text(self.context.clone()));
            if let Some(name) = &self.name {
                row.insert("name".into(), Value::Text(name.clone()));
            }
        }

        for (field, def) in self.meta.fields.iter() {
            if !def.kind.is_column() || is_created_at(field) || is_updated_at(field) {
                continue;
            }
            if self.schema.uses_default_identity() && DEFAULT_IDENTITY_COLUMNS.contains(&field) {
                continue;
            }
            if let Some(value) = self.fields.get(field) {
                row.insert(field.to_string(), value.clone());
            }
        }

        row.insert(
            "created_at".into(),
            self.created_at.map(Value::Timestamp).unwrap_or(Value::Null),
        );
        row.insert(
            "updated_at".into(),
            self.updated_at.map(Value::Timestamp).unwrap_or(Value::Null),
        );
        row
    }

    /// Validates, assigns identity and timestamps, then upserts.
    ///
    /// Transient backend failures are retried under the registry's retry
    /// policy; validation and configuration failures never are. A unique or
    /// not-null violation comes back as a validation error naming the column.
    pub async fn save(&mut self) -> Result<()> {
        let span = info_span!(
            "persistry.entity.save",
            type_name = %self.meta.name,
            id = %self.id().unwrap_or_default()
        );
        let result = self.save_steps().instrument(span).await;
        match result {
            Ok(()) => {
                self.state = EntityState::Saved;
                self.dirty = false;
                Ok(())
            }
            Err(err) => {
                self.state = EntityState::Failed;
                Err(err)
            }
        }
    }

    async fn save_steps(&mut self) -> Result<()> {
        self.validate().await?;
        self.assign_identity()?;
        self.assign_slug();

        // storage keeps microseconds
        let now = Utc::now().trunc_subsecs(6);
        self.updated_at = Some(now);
        if self.created_at.is_none() {
            self.created_at = Some(now);
        }

        let schema = self
            .registry
            .ensure_table(&self.session, &self.meta.name)
            .await?;
        self.schema = schema.clone();

        let row = self.to_row();
        let conflict = schema.conflict_columns();
        let retry = self.registry.config().retry.clone();
        let mut attempt = 1;
        loop {
            match self.session.upsert(&schema.table_name, &conflict, &row).await {
                Ok(_) => break,
                Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                    let backoff_ms = retry.backoff_ms(attempt);
                    event!(
                        Level::WARN,
                        attempt,
                        backoff_ms,
                        error = %err,
                        "Transient failure while saving entity, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(err) => {
                    let err = translate_constraint_error(err, self.session.dialect(), &row);
                    event!(
                        Level::ERROR,
                        attempt,
                        code = err.code_str(),
                        error = %err,
                        "Failed to save entity"
                    );
                    return Err(err);
                }
            }
        }

        self.reconcile(&row).await?;

        if let Some(id) = self.id() {
            self.registry
                .record_signal(&self.session, &self.meta.name, &id, "saved", self.to_json())
                .await?;
        }
        Ok(())
    }

    /// Adopts the stored identity and creation time after an upsert that may
    /// have merged into an existing row.
    async fn reconcile(&mut self, row: &Record) -> Result<()> {
        let mut filter = Filter::new();
        for column in self.schema.conflict_columns() {
            filter = filter.eq(column, row.get(column).cloned().unwrap_or(Value::Null));
        }
        let Some(stored) = self.fetch_row(&filter).await? else {
            return Ok(());
        };

        if self.schema.uses_default_identity() {
            if let Some(id) = stored.get("id").and_then(Value::key_string) {
                self.id = Some(id);
            }
        }
        if let Some(created) = stored.get("created_at").and_then(Value::as_timestamp) {
            self.created_at = Some(created);
        }
        Ok(())
    }

    /// Deletes the stored row, running the type's hooks around it.
    ///
    /// A failing `before_delete` hook aborts the deletion. Returns whether a
    /// row was removed.
    pub async fn delete(&mut self) -> Result<bool> {
        let Some(id) = self.id() else {
            return Err(self.missing_identity("delete"));
        };

        if let Some(hook) = &self.meta.before_delete {
            hook(self.clone())
                .await
                .map_err(|err| hook_failed("before_delete", &self.meta.name, err))?;
        }

        let schema = self
            .registry
            .ensure_table(&self.session, &self.meta.name)
            .await?;
        let dialect = self.session.dialect();
        let sql = format!(
            "DELETE FROM {} WHERE {} = {}",
            dialect.quote_ident(&schema.table_name),
            dialect.quote_ident(schema.key_column()),
            dialect.placeholder(1)
        );
        let removed = self.session.execute(&sql, &[self.key_value()]).await?;

        if let Some(hook) = &self.meta.after_delete {
            hook(self.clone())
                .await
                .map_err(|err| hook_failed("after_delete", &self.meta.name, err))?;
        }

        self.state = EntityState::Deleted;
        self.registry
            .record_signal(
                &self.session,
                &self.meta.name,
                &id,
                "deleted",
                serde_json::json!({ "removed": removed }),
            )
            .await?;

        event!(Level::DEBUG, type_name = %self.meta.name, id = %id, removed, "Deleted entity");
        Ok(removed > 0)
    }
}

fn hook_failed(hook: &str, type_name: &str, err: PersistError) -> PersistError {
    PersistError::runtime(
        ErrorCode::HookFailed,
        format!("{} hook failed for '{}': {}", hook, type_name, err),
    )
    .with_detail("hook", hook)
    .with_source(err)
}
