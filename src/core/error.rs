use super::value::Value;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Broad error family. Retry decisions are made on this plus `transient`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Validation,
    Database,
    Configuration,
    Runtime,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Database => "database",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Runtime => "runtime",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // validation
    Required,
    MinValue,
    MaxValue,
    MinLength,
    MaxLength,
    Pattern,
    Custom,
    InvalidIdentity,
    InvalidOperator,
    InvalidIdentifier,
    InvalidOrder,
    UniqueViolation,
    NotNullViolation,
    // database
    Connection,
    QueryFailed,
    SchemaFailed,
    ConstraintViolation,
    Transient,
    // configuration
    InvalidConfig,
    UnknownType,
    UnknownField,
    UnknownRelationship,
    MissingInverse,
    CircularDependency,
    // runtime
    ImmutableIdentity,
    MissingIdentity,
    Unsupported,
    HookFailed,
    InvalidState,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Required => "required",
            ErrorCode::MinValue => "min_value",
            ErrorCode::MaxValue => "max_value",
            ErrorCode::MinLength => "min_length",
            ErrorCode::MaxLength => "max_length",
            ErrorCode::Pattern => "pattern",
            ErrorCode::Custom => "custom",
            ErrorCode::InvalidIdentity => "invalid_identity",
            ErrorCode::InvalidOperator => "invalid_operator",
            ErrorCode::InvalidIdentifier => "invalid_identifier",
            ErrorCode::InvalidOrder => "invalid_order",
            ErrorCode::UniqueViolation => "unique_violation",
            ErrorCode::NotNullViolation => "not_null_violation",
            ErrorCode::Connection => "connection",
            ErrorCode::QueryFailed => "query_failed",
            ErrorCode::SchemaFailed => "schema_failed",
            ErrorCode::ConstraintViolation => "constraint_violation",
            ErrorCode::Transient => "transient",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::UnknownType => "unknown_type",
            ErrorCode::UnknownField => "unknown_field",
            ErrorCode::UnknownRelationship => "unknown_relationship",
            ErrorCode::MissingInverse => "missing_inverse",
            ErrorCode::CircularDependency => "circular_dependency",
            ErrorCode::ImmutableIdentity => "immutable_identity",
            ErrorCode::MissingIdentity => "missing_identity",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::HookFailed => "hook_failed",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::Internal => "internal",
        }
    }

    pub fn is_constraint(self) -> bool {
        matches!(
            self,
            ErrorCode::UniqueViolation
                | ErrorCode::NotNullViolation
                | ErrorCode::ConstraintViolation
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed field check.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub value: Option<Value>,
    pub constraint: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(
        field: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            value: None,
            constraint: constraint.into(),
            message: message.into(),
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field '{}' failed '{}': {}", self.field, self.constraint, self.message)
    }
}

pub type Details = BTreeMap<String, serde_json::Value>;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Validation error: {error}")]
    Validation {
        code: ErrorCode,
        error: ValidationError,
        #[source]
        source: Option<Box<PersistError>>,
    },

    #[error("Database error ({code}): {message}")]
    Database {
        code: ErrorCode,
        message: String,
        transient: bool,
        details: Details,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Configuration error ({code}): {message}")]
    Configuration {
        code: ErrorCode,
        message: String,
        details: Details,
    },

    #[error("Runtime error ({code}): {message}")]
    Runtime {
        code: ErrorCode,
        message: String,
        details: Details,
        #[source]
        source: Option<BoxError>,
    },
}

pub type Result<T> = std::result::Result<T, PersistError>;

impl PersistError {
    pub fn validation(code: ErrorCode, error: ValidationError) -> Self {
        Self::Validation {
            code,
            error,
            source: None,
        }
    }

    pub fn database(code: ErrorCode, message: impl Into<String>, transient: bool) -> Self {
        Self::Database {
            code,
            message: message.into(),
            transient,
            details: Details::new(),
            source: None,
        }
    }

    pub fn configuration(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Configuration {
            code,
            message: message.into(),
            details: Details::new(),
        }
    }

    pub fn runtime(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Runtime {
            code,
            message: message.into(),
            details: Details::new(),
            source: None,
        }
    }

    /// Attaches a contextual detail. Ignored on validation errors, whose
    /// details are derived from the failed field.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        match &mut self {
            Self::Database { details, .. }
            | Self::Configuration { details, .. }
            | Self::Runtime { details, .. } => {
                details.insert(key.into(), value);
            }
            Self::Validation { .. } => {}
        }
        self
    }

    pub fn with_source(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        match &mut self {
            Self::Database { source, .. } | Self::Runtime { source, .. } => {
                *source = Some(Box::new(cause));
            }
            Self::Validation { .. } | Self::Configuration { .. } => {}
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Database { .. } => ErrorKind::Database,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Runtime { .. } => ErrorKind::Runtime,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { code, .. }
            | Self::Database { code, .. }
            | Self::Configuration { code, .. }
            | Self::Runtime { code, .. } => *code,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Only transient backend failures qualify for a retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database { transient: true, .. })
    }

    pub fn validation_error(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Validation { error, .. } => error.message.clone(),
            Self::Database { message, .. }
            | Self::Configuration { message, .. }
            | Self::Runtime { message, .. } => message.clone(),
        }
    }

    /// Structured, redacted form of the error for logs.
    pub fn report(&self) -> ErrorReport {
        let mut details = match self {
            Self::Validation { error, .. } => {
                let mut details = Details::new();
                details.insert("field".to_string(), error.field.clone().into());
                details.insert("constraint".to_string(), error.constraint.clone().into());
                if let Some(value) = &error.value {
                    details.insert("value".to_string(), value.to_json());
                }
                details
            }
            Self::Database {
                details, transient, ..
            } => {
                let mut details = details.clone();
                details.insert("transient".to_string(), (*transient).into());
                details
            }
            Self::Configuration { details, .. } | Self::Runtime { details, .. } => details.clone(),
        };
        redact_details(&mut details);

        let cause = std::error::Error::source(self).map(|cause| {
            Box::new(match cause.downcast_ref::<PersistError>() {
                Some(inner) => inner.report(),
                None => ErrorReport {
                    kind: "external".to_string(),
                    code: "source".to_string(),
                    message: cause.to_string(),
                    details: Details::new(),
                    cause: None,
                },
            })
        });

        ErrorReport {
            kind: self.kind().as_str().to_string(),
            code: self.code_str().to_string(),
            message: self.message(),
            details,
            cause,
        }
    }
}

impl From<ValidationError> for PersistError {
    fn from(error: ValidationError) -> Self {
        Self::validation(ErrorCode::Custom, error)
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        Self::runtime(ErrorCode::Internal, format!("JSON conversion failed: {}", err))
            .with_source(err)
    }
}

impl From<anyhow::Error> for PersistError {
    fn from(err: anyhow::Error) -> Self {
        let message = err.to_string();
        Self::Runtime {
            code: ErrorCode::Internal,
            message,
            details: Details::new(),
            source: Some(err.into()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for PersistError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::runtime(ErrorCode::Internal, format!("Lock poisoned: {}", err))
    }
}

/// Serializable error shape: `{kind, code, message, details, cause}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorReport {
    pub kind: String,
    pub code: String,
    pub message: String,
    pub details: Details,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorReport>>,
}

impl ErrorReport {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

const REDACTED: &str = "[REDACTED]";
const SENSITIVE_EXACT: &[&str] = &["key", "apikey", "api_key"];
const SENSITIVE_PARTS: &[&str] = &["password", "token", "secret", "apikey", "api_key"];

pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_EXACT.contains(&lower.as_str())
        || SENSITIVE_PARTS.iter().any(|part| lower.contains(part))
}

fn redact_details(details: &mut Details) {
    // `value` belongs to the column named by `field`
    let sensitive_field = details
        .get("field")
        .and_then(serde_json::Value::as_str)
        .is_some_and(is_sensitive_key);
    if sensitive_field {
        if let Some(value) = details.get_mut("value") {
            *value = serde_json::Value::String(REDACTED.to_string());
        }
    }

    for (key, value) in details.iter_mut() {
        if is_sensitive_key(key) {
            *value = serde_json::Value::String(REDACTED.to_string());
        } else {
            redact_json(value);
        }
    }
}

fn redact_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *nested = serde_json::Value::String(REDACTED.to_string());
                } else {
                    redact_json(nested);
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact_json),
        _ => {}
    }
}
