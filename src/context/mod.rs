//! Scoped key/value memory attached to an entity or a whole collection.
//!
//! Records live in the shared `{prefix}context_memory` table and are keyed by
//! `(owner_type, owner_id, scope, key, version)`. Scopes are `/`-delimited
//! paths; recall can walk from a scope up through its ancestors to `global`.

use crate::core::{ErrorCode, FieldKind, PersistError, Record, Result, Value};
use crate::schema::new_entity_id;
use crate::session::PersistSession;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

/// Owner id used for memory that belongs to a collection rather than to one
/// of its entities.
pub const COLLECTION_OWNER: &str = "__collection__";

pub const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone, PartialEq)]
pub struct RememberOptions {
    pub scope: String,
    pub metadata: Option<serde_json::Value>,
    pub confidence: f64,
    pub ttl: Option<Duration>,
    pub version: i64,
}

impl Default for RememberOptions {
    fn default() -> Self {
        Self {
            scope: GLOBAL_SCOPE.to_string(),
            metadata: None,
            confidence: 1.0,
            ttl: None,
            version: 1,
        }
    }
}

impl RememberOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Clamped to `[0, 1]`; NaN reads as zero.
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecallOptions {
    pub scope: String,
    pub include_ancestors: bool,
    pub min_confidence: f64,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            scope: GLOBAL_SCOPE.to_string(),
            include_ancestors: false,
            min_confidence: 0.0,
        }
    }
}

impl RecallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn include_ancestors(mut self) -> Self {
        self.include_ancestors = true;
        self
    }

    pub fn min_confidence(mut self, min: f64) -> Self {
        self.min_confidence = clamp_confidence(min);
        self
    }
}

/// One stored memory.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: String,
    pub owner_type: String,
    pub owner_id: String,
    pub scope: String,
    pub key: String,
    pub value: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub version: i64,
    pub confidence: f64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    fn from_row(row: &Record) -> Self {
        let text = |column: &str| {
            row.get(column)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let json = |column: &str| {
            row.get(column)
                .cloned()
                .unwrap_or(Value::Null)
                .coerce(FieldKind::Json)
        };
        let timestamp = |column: &str| row.get(column).and_then(Value::as_timestamp);

        let metadata = match json("metadata") {
            Value::Null => None,
            other => Some(other.to_json()),
        };

        Self {
            id: text("id"),
            owner_type: text("owner_type"),
            owner_id: text("owner_id"),
            scope: text("scope"),
            key: text("key"),
            value: json("value").to_json(),
            metadata,
            version: row.get("version").and_then(Value::as_i64).unwrap_or(1),
            confidence: row.get("confidence").and_then(Value::as_f64).unwrap_or(1.0),
            created_at: timestamp("created_at"),
            updated_at: timestamp("updated_at"),
            last_used_at: timestamp("last_used_at"),
            expires_at: timestamp("expires_at"),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// `a/b/c` → `a/b` → `a` → `global` → none.
pub fn parent_scope(scope: &str) -> Option<String> {
    if scope == GLOBAL_SCOPE {
        return None;
    }
    match scope.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => Some(parent.to_string()),
        _ => Some(GLOBAL_SCOPE.to_string()),
    }
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Memory operations for a single owner.
#[derive(Debug, Clone)]
pub struct ContextStore {
    session: PersistSession,
    table: String,
    owner_type: String,
    owner_id: String,
}

impl ContextStore {
    pub fn new(
        session: PersistSession,
        table: impl Into<String>,
        owner_type: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            session,
            table: table.into(),
            owner_type: owner_type.into(),
            owner_id: owner_id.into(),
        }
    }

    pub fn owner_type(&self) -> &str {
        &self.owner_type
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn placeholders(&self, count: usize) -> Vec<String> {
        let dialect = self.session.dialect();
        (1..=count).map(|i| dialect.placeholder(i)).collect()
    }

    /// Stores `value` under `key`, replacing the same version if present.
    pub async fn remember(
        &self,
        key: &str,
        value: serde_json::Value,
        options: RememberOptions,
    ) -> Result<MemoryRecord> {
        if key.is_empty() {
            return Err(PersistError::runtime(
                ErrorCode::InvalidState,
                "Context memory key cannot be empty",
            ));
        }

        let now = Utc::now();
        let expires_at = match options.ttl {
            Some(ttl) => {
                let ttl = TimeDelta::from_std(ttl).map_err(|err| {
                    PersistError::configuration(
                        ErrorCode::InvalidConfig,
                        format!("Context memory ttl out of range: {}", err),
                    )
                })?;
                Value::from(now + ttl)
            }
            None => Value::Null,
        };

        let row = crate::record! {
            "id" => new_entity_id(),
            "owner_type" => self.owner_type.as_str(),
            "owner_id" => self.owner_id.as_str(),
            "scope" => options.scope.as_str(),
            "key" => key,
            "value" => Value::Json(value),
            "metadata" => options.metadata.clone().map(Value::Json).unwrap_or(Value::Null),
            "version" => options.version,
            "confidence" => clamp_confidence(options.confidence),
            "created_at" => now,
            "updated_at" => now,
            "expires_at" => expires_at,
        };
        self.session
            .upsert(
                &self.table,
                &["owner_type", "owner_id", "scope", "key", "version"],
                &row,
            )
            .await?;

        let p = self.placeholders(5);
        let sql = format!(
            "SELECT * FROM {} WHERE owner_type = {} AND owner_id = {} AND scope = {} AND key = {} AND version = {}",
            self.table, p[0], p[1], p[2], p[3], p[4]
        );
        let result = self
            .session
            .query(
                &sql,
                &[
                    Value::from(self.owner_type.as_str()),
                    Value::from(self.owner_id.as_str()),
                    Value::from(options.scope.as_str()),
                    Value::from(key),
                    Value::from(options.version),
                ],
            )
            .await?;

        result.first().map(MemoryRecord::from_row).ok_or_else(|| {
            PersistError::runtime(
                ErrorCode::InvalidState,
                format!("Context memory '{}' was not readable after write", key),
            )
        })
    }

    async fn lookup(
        &self,
        key: &str,
        scope: &str,
        min_confidence: f64,
    ) -> Result<Option<MemoryRecord>> {
        let p = self.placeholders(6);
        let sql = format!(
            "SELECT * FROM {} WHERE owner_type = {} AND owner_id = {} AND scope = {} AND key = {} \
             AND confidence >= {} AND (expires_at IS NULL OR expires_at > {}) \
             ORDER BY version DESC LIMIT 1",
            self.table, p[0], p[1], p[2], p[3], p[4], p[5]
        );
        let result = self
            .session
            .query(
                &sql,
                &[
                    Value::from(self.owner_type.as_str()),
                    Value::from(self.owner_id.as_str()),
                    Value::from(scope),
                    Value::from(key),
                    Value::from(min_confidence),
                    Value::from(Utc::now()),
                ],
            )
            .await?;
        Ok(result.first().map(MemoryRecord::from_row))
    }

    /// Latest live version of `key`. With ancestors enabled, parent scopes
    /// are tried in turn until one matches.
    pub async fn recall(&self, key: &str, options: RecallOptions) -> Result<Option<MemoryRecord>> {
        let mut scope = Some(options.scope.clone());

        while let Some(current) = scope {
            if let Some(mut found) = self.lookup(key, &current, options.min_confidence).await? {
                let now = Utc::now();
                let p = self.placeholders(2);
                self.session
                    .execute(
                        &format!(
                            "UPDATE {} SET last_used_at = {} WHERE id = {}",
                            self.table, p[0], p[1]
                        ),
                        &[Value::from(now), Value::from(found.id.as_str())],
                    )
                    .await?;
                found.last_used_at = Some(now);
                return Ok(Some(found));
            }
            if !options.include_ancestors {
                break;
            }
            scope = parent_scope(&current);
        }
        Ok(None)
    }

    /// Latest live version of every key in `scope`, ordered by key.
    pub async fn recall_all(&self, scope: &str) -> Result<Vec<MemoryRecord>> {
        let p = self.placeholders(4);
        let sql = format!(
            "SELECT * FROM {} WHERE owner_type = {} AND owner_id = {} AND scope = {} \
             AND (expires_at IS NULL OR expires_at > {}) ORDER BY key ASC, version DESC",
            self.table, p[0], p[1], p[2], p[3]
        );
        let result = self
            .session
            .query(
                &sql,
                &[
                    Value::from(self.owner_type.as_str()),
                    Value::from(self.owner_id.as_str()),
                    Value::from(scope),
                    Value::from(Utc::now()),
                ],
            )
            .await?;

        let mut seen = BTreeSet::new();
        Ok(result
            .rows
            .iter()
            .map(MemoryRecord::from_row)
            .filter(|record| seen.insert(record.key.clone()))
            .collect())
    }

    /// Removes every version of `key` in `scope`.
    pub async fn forget(&self, key: &str, scope: &str) -> Result<bool> {
        let p = self.placeholders(4);
        let sql = format!(
            "DELETE FROM {} WHERE owner_type = {} AND owner_id = {} AND scope = {} AND key = {}",
            self.table, p[0], p[1], p[2], p[3]
        );
        let removed = self
            .session
            .execute(
                &sql,
                &[
                    Value::from(self.owner_type.as_str()),
                    Value::from(self.owner_id.as_str()),
                    Value::from(scope),
                    Value::from(key),
                ],
            )
            .await?;
        Ok(removed > 0)
    }

    /// Removes `scope` and every scope nested beneath it.
    pub async fn forget_scope(&self, scope: &str) -> Result<u64> {
        let p = self.placeholders(4);
        let sql = format!(
            "DELETE FROM {} WHERE owner_type = {} AND owner_id = {} \
             AND (scope = {} OR scope LIKE {} ESCAPE '\\')",
            self.table, p[0], p[1], p[2], p[3]
        );
        self.session
            .execute(
                &sql,
                &[
                    Value::from(self.owner_type.as_str()),
                    Value::from(self.owner_id.as_str()),
                    Value::from(scope),
                    Value::from(format!("{}/%", escape_like(scope))),
                ],
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SystemTables;
    use serde_json::json;

    async fn store(owner_id: &str) -> ContextStore {
        let session = PersistSession::in_memory().expect("session");
        let tables = SystemTables::new("t_");
        session
            .sync_schema(&tables.script(session.dialect()))
            .await
            .expect("system tables");
        ContextStore::new(session, tables.context_memory(), "Agent", owner_id)
    }

    #[test]
    fn scope_parents() {
        assert_eq!(parent_scope("a/b/c").as_deref(), Some("a/b"));
        assert_eq!(parent_scope("a").as_deref(), Some("global"));
        assert_eq!(parent_scope("global"), None);
        assert_eq!(escape_like("a_b%"), "a\\_b\\%");
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(RememberOptions::new().confidence(1.7).confidence, 1.0);
        assert_eq!(RememberOptions::new().confidence(-2.0).confidence, 0.0);
        assert_eq!(RememberOptions::new().confidence(f64::NAN).confidence, 0.0);
    }

    #[tokio::test]
    async fn remember_then_recall_latest_version() {
        let store = store("a1").await;
        store
            .remember("tone", json!("formal"), RememberOptions::new())
            .await
            .expect("v1");
        let saved = store
            .remember(
                "tone",
                json!({"style": "casual"}),
                RememberOptions::new().version(2).metadata(json!({"by": "test"})),
            )
            .await
            .expect("v2");
        assert_eq!(saved.version, 2);
        assert_eq!(saved.metadata, Some(json!({"by": "test"})));

        let found = store
            .recall("tone", RecallOptions::new())
            .await
            .expect("recall")
            .expect("present");
        assert_eq!(found.value, json!({"style": "casual"}));
        assert!(found.last_used_at.is_some());
    }

    #[tokio::test]
    async fn owners_are_isolated_and_confidence_filters() {
        let first = store("a1").await;
        let other = ContextStore::new(
            first.session.clone(),
            first.table.clone(),
            "Agent",
            COLLECTION_OWNER,
        );
        first
            .remember("k", json!(1), RememberOptions::new().confidence(0.4))
            .await
            .expect("remember");

        assert!(other.recall("k", RecallOptions::new()).await.expect("recall").is_none());
        assert!(
            first
                .recall("k", RecallOptions::new().min_confidence(0.5))
                .await
                .expect("recall")
                .is_none()
        );
        assert!(first.recall("k", RecallOptions::new()).await.expect("recall").is_some());
    }

    #[tokio::test]
    async fn forget_scope_removes_descendants_only() {
        let store = store("a1").await;
        for scope in ["proj", "proj/x", "proj/x/y", "project", "proj_x"] {
            store
                .remember("k", json!(scope), RememberOptions::new().scope(scope))
                .await
                .expect("remember");
        }

        assert_eq!(store.forget_scope("proj").await.expect("forget"), 3);
        assert_eq!(store.recall_all("project").await.expect("all").len(), 1);
        assert_eq!(store.recall_all("proj_x").await.expect("all").len(), 1);
        assert!(store.forget("k", "project").await.expect("forget"));
        assert!(!store.forget("k", "project").await.expect("forget"));
    }
}
