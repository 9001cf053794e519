use super::types::FieldKind;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Column name -> value, the unit passed to and from storage.
pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

/// Fixed-width UTC form so stored timestamps compare lexically.
pub fn timestamp_to_storage(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Integer(_) => "INTEGER",
            Self::Float(_) => "FLOAT",
            Self::Text(_) => "TEXT",
            Self::Boolean(_) => "BOOLEAN",
            Self::Timestamp(_) => "TIMESTAMP",
            Self::Json(_) => "JSON",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Null, or a text value that carries no identity.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Integer(_) | Self::Float(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) => {
                if f.is_finite() && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Some(*f as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            Self::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::Text(s) => parse_timestamp(s),
            _ => None,
        }
    }

    /// Stable string used to group and match key values across rows.
    pub fn key_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) if s.is_empty() => None,
            Self::Text(s) => Some(s.clone()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Boolean(b) => Some(b.to_string()),
            Self::Timestamp(ts) => Some(timestamp_to_storage(ts)),
            Self::Json(v) => Some(v.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Boolean(b) => serde_json::Value::Bool(*b),
            Self::Timestamp(ts) => serde_json::Value::String(timestamp_to_storage(ts)),
            Self::Json(v) => v.clone(),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Self::Text(s),
            other => Self::Json(other),
        }
    }

    /// Reinterprets a raw storage value as the declared field kind.
    ///
    /// Backends without native boolean/timestamp/json types hand those back
    /// as integers or text.
    pub fn coerce(self, kind: FieldKind) -> Self {
        match (kind, self) {
            (_, Self::Null) => Self::Null,
            (FieldKind::Boolean, Self::Integer(i)) => Self::Boolean(i != 0),
            (FieldKind::Boolean, Self::Text(s)) => match s.as_str() {
                "true" | "1" => Self::Boolean(true),
                "false" | "0" => Self::Boolean(false),
                _ => Self::Text(s),
            },
            (FieldKind::Decimal, Self::Integer(i)) => Self::Float(i as f64),
            (FieldKind::Integer, Self::Float(f)) if f.fract() == 0.0 => Self::Integer(f as i64),
            (FieldKind::DateTime, Self::Text(s)) => match parse_timestamp(&s) {
                Some(ts) => Self::Timestamp(ts),
                None => Self::Text(s),
            },
            (FieldKind::Json, Self::Text(s)) => match serde_json::from_str(&s) {
                Ok(json) => Self::Json(json),
                Err(_) => Self::Text(s),
            },
            (FieldKind::Text | FieldKind::ForeignKey, Self::Integer(i)) => {
                Self::Text(i.to_string())
            }
            (_, other) => other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => {
                if a.is_nan() && b.is_nan() {
                    return true;
                }
                (a - b).abs() < f64::EPSILON
            }
            (Self::Integer(i), Self::Float(f)) | (Self::Float(f), Self::Integer(i)) => {
                (*i as f64 - f).abs() < f64::EPSILON
            }
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Timestamp(a), Self::Timestamp(b)) => a == b,
            (Self::Json(a), Self::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Timestamp(ts) => write!(f, "{}", timestamp_to_storage(ts)),
            Self::Json(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::from_json(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => Self::Null,
        }
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Self::Json(serde_json::Value::Array(
            values.into_iter().map(|v| v.into().to_json()).collect(),
        ))
    }
}

/// Builds a [`Record`] from `key => value` pairs.
#[macro_export]
macro_rules! record {
    () => { $crate::core::Record::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::core::Record::new();
        $( record.insert(($key).to_string(), $crate::core::Value::from($value)); )+
        record
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_keeps_integer_and_float_apart() {
        assert_eq!(Value::from_json(json!(3)), Value::Integer(3));
        assert!(matches!(Value::from_json(json!(3.5)), Value::Float(_)));
        assert!(matches!(Value::from_json(json!({"a": 1})), Value::Json(_)));
    }

    #[test]
    fn coerce_restores_declared_kinds_from_storage() {
        assert_eq!(Value::Integer(1).coerce(FieldKind::Boolean), Value::Boolean(true));
        let ts = Utc::now();
        let stored = Value::Text(timestamp_to_storage(&ts));
        match stored.coerce(FieldKind::DateTime) {
            Value::Timestamp(parsed) => {
                assert_eq!(timestamp_to_storage(&parsed), timestamp_to_storage(&ts))
            }
            other => panic!("expected timestamp, got {:?}", other),
        }
        assert_eq!(
            Value::Text("[1,2]".into()).coerce(FieldKind::Json),
            Value::Json(json!([1, 2]))
        );
    }

    #[test]
    fn blank_values_have_no_key() {
        assert_eq!(Value::Null.key_string(), None);
        assert_eq!(Value::Text(String::new()).key_string(), None);
        assert_eq!(Value::Integer(7).key_string().as_deref(), Some("7"));
    }

    #[test]
    fn record_macro_builds_values() {
        let record = record! { "name" => "Widget", "price" => 9.5, "active" => true };
        assert_eq!(record["name"], Value::Text("Widget".into()));
        assert_eq!(record["active"], Value::Boolean(true));
    }
}
