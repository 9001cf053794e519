use super::value::{Value, parse_timestamp};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;

/// Columns every default-keyed entity carries regardless of its field map.
pub const BASE_FIELDS: &[&str] = &["id", "slug", "context", "name", "created_at", "updated_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Boolean,
    DateTime,
    Json,
    ForeignKey,
    OneToMany,
    ManyToMany,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Decimal => "decimal",
            Self::Boolean => "boolean",
            Self::DateTime => "datetime",
            Self::Json => "json",
            Self::ForeignKey => "foreignKey",
            Self::OneToMany => "oneToMany",
            Self::ManyToMany => "manyToMany",
        }
    }

    pub fn is_relationship(self) -> bool {
        matches!(self, Self::ForeignKey | Self::OneToMany | Self::ManyToMany)
    }

    /// Collection-valued relationships live on the other table; they never
    /// become columns.
    pub fn is_column(self) -> bool {
        !matches!(self, Self::OneToMany | Self::ManyToMany)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldOptions {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub primary_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub indexed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDef {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub options: FieldOptions,
}

impl FieldDef {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            options: FieldOptions::default(),
        }
    }

    pub fn text() -> Self {
        Self::new(FieldKind::Text)
    }

    pub fn integer() -> Self {
        Self::new(FieldKind::Integer)
    }

    pub fn decimal() -> Self {
        Self::new(FieldKind::Decimal)
    }

    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    pub fn datetime() -> Self {
        Self::new(FieldKind::DateTime)
    }

    pub fn json() -> Self {
        Self::new(FieldKind::Json)
    }

    pub fn foreign_key(target: impl Into<String>) -> Self {
        Self::new(FieldKind::ForeignKey).related(target)
    }

    pub fn one_to_many(target: impl Into<String>) -> Self {
        Self::new(FieldKind::OneToMany).related(target)
    }

    pub fn many_to_many(target: impl Into<String>) -> Self {
        Self::new(FieldKind::ManyToMany).related(target)
    }

    pub fn required(mut self) -> Self {
        self.options.required = true;
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.options.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.options.max = Some(max);
        self
    }

    pub fn min_length(mut self, len: usize) -> Self {
        self.options.min_length = Some(len);
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.options.max_length = Some(len);
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.options.pattern = Some(pattern.into());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.options.primary_key = true;
        self
    }

    pub fn related(mut self, target: impl Into<String>) -> Self {
        self.options.related = Some(target.into());
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.options.default = Some(value.into());
        self
    }

    pub fn indexed(mut self) -> Self {
        self.options.indexed = true;
        self
    }

    pub fn is_required(&self) -> bool {
        self.options.required || self.options.primary_key
    }
}

/// Field definitions in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    entries: Vec<(String, FieldDef)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a field; a replaced field keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, def: FieldDef) {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = def,
            None => self.entries.push((name, def)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.insert(name, def);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, def)| def)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldDef)> {
        self.entries.iter().map(|(name, def)| (name.as_str(), def))
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn primary_key(&self) -> Option<(&str, &FieldDef)> {
        self.iter().find(|(_, def)| def.options.primary_key)
    }

    /// Fields that carry a relationship, in declaration order.
    pub fn relationship_fields(&self) -> impl Iterator<Item = (&str, &FieldDef)> {
        self.iter().filter(|(_, def)| def.kind.is_relationship())
    }

    /// Infers a field map from a sample JSON object.
    ///
    /// Lossy: a float default that happens to be whole reads as `integer`,
    /// and `null` defaults read as `text`. Keys with a leading underscore
    /// and the implicit base fields are skipped.
    pub fn infer_from_sample(sample: &serde_json::Value) -> Self {
        let mut fields = FieldMap::new();
        let Some(object) = sample.as_object() else {
            return fields;
        };

        for (name, value) in object {
            if name.starts_with('_') || is_base_field(name) {
                continue;
            }
            let kind = match value {
                serde_json::Value::String(s) if parse_timestamp(s).is_some() => FieldKind::DateTime,
                serde_json::Value::String(_) | serde_json::Value::Null => FieldKind::Text,
                serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => FieldKind::Integer,
                serde_json::Value::Number(_) => FieldKind::Decimal,
                serde_json::Value::Bool(_) => FieldKind::Boolean,
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => FieldKind::Json,
            };
            fields.insert(name.clone(), FieldDef::new(kind));
        }
        fields
    }
}

impl Serialize for FieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, def) in &self.entries {
            map.serialize_entry(name, def)?;
        }
        map.end()
    }
}

/// Matches the base identity/timestamp fields under either naming convention.
pub fn is_base_field(name: &str) -> bool {
    BASE_FIELDS.contains(&name) || matches!(name, "createdAt" | "updatedAt")
}

pub fn is_created_at(name: &str) -> bool {
    matches!(name, "created_at" | "createdAt")
}

pub fn is_updated_at(name: &str) -> bool {
    matches!(name, "updated_at" | "updatedAt")
}
