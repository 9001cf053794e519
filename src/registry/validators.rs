use crate::core::{ErrorCode, FieldMap, PersistError, Result, ValidationError, Value};
use futures::future::BoxFuture;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Caller-supplied async check on a single field value.
pub type AsyncPredicate = Arc<dyn Fn(Value) -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Clone)]
pub enum Rule {
    Required,
    Min(f64),
    Max(f64),
    MinLength(usize),
    MaxLength(usize),
    Pattern(Regex),
    Custom(AsyncPredicate),
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Required => write!(f, "Required"),
            Rule::Min(v) => write!(f, "Min({})", v),
            Rule::Max(v) => write!(f, "Max({})", v),
            Rule::MinLength(v) => write!(f, "MinLength({})", v),
            Rule::MaxLength(v) => write!(f, "MaxLength({})", v),
            Rule::Pattern(re) => write!(f, "Pattern({})", re.as_str()),
            Rule::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// One compiled check bound to a field.
#[derive(Debug, Clone)]
pub struct Validator {
    pub field: String,
    pub rule: Rule,
}

impl Validator {
    pub fn new(field: impl Into<String>, rule: Rule) -> Self {
        Self {
            field: field.into(),
            rule,
        }
    }

    /// Returns the failure for `value`, if any. Optional rules skip nulls.
    pub async fn check(&self, value: &Value) -> Option<PersistError> {
        let field = self.field.as_str();
        if value.is_null() && !matches!(self.rule, Rule::Required) {
            return None;
        }

        match &self.rule {
            Rule::Required if value.is_blank() => Some(failure(
                ErrorCode::Required,
                field,
                "required",
                format!("{} is required", field),
                value,
            )),
            Rule::Required => None,
            Rule::Min(min) => match value.as_f64() {
                Some(n) if n >= *min => None,
                Some(_) => Some(failure(
                    ErrorCode::MinValue,
                    field,
                    "min",
                    format!("{} must be at least {}", field, min),
                    value,
                )),
                None => Some(not_numeric(ErrorCode::MinValue, field, "min", value)),
            },
            Rule::Max(max) => match value.as_f64() {
                Some(n) if n <= *max => None,
                Some(_) => Some(failure(
                    ErrorCode::MaxValue,
                    field,
                    "max",
                    format!("{} must be at most {}", field, max),
                    value,
                )),
                None => Some(not_numeric(ErrorCode::MaxValue, field, "max", value)),
            },
            Rule::MinLength(min) => match length_of(value) {
                Some(len) if len < *min => Some(failure(
                    ErrorCode::MinLength,
                    field,
                    "minLength",
                    format!("{} must be at least {} characters", field, min),
                    value,
                )),
                _ => None,
            },
            Rule::MaxLength(max) => match length_of(value) {
                Some(len) if len > *max => Some(failure(
                    ErrorCode::MaxLength,
                    field,
                    "maxLength",
                    format!("{} must be at most {} characters", field, max),
                    value,
                )),
                _ => None,
            },
            Rule::Pattern(re) => match value.as_str() {
                Some(text) if re.is_match(text) => None,
                _ => Some(failure(
                    ErrorCode::Pattern,
                    field,
                    "pattern",
                    format!("{} does not match {}", field, re.as_str()),
                    value,
                )),
            },
            Rule::Custom(predicate) => {
                if predicate(value.clone()).await {
                    None
                } else {
                    Some(failure(
                        ErrorCode::Custom,
                        field,
                        "custom",
                        format!("{} failed custom validation", field),
                        value,
                    ))
                }
            }
        }
    }
}

fn failure(
    code: ErrorCode,
    field: &str,
    constraint: &str,
    message: String,
    value: &Value,
) -> PersistError {
    PersistError::validation(
        code,
        ValidationError::new(field, constraint, message).with_value(value.clone()),
    )
}

fn not_numeric(code: ErrorCode, field: &str, constraint: &str, value: &Value) -> PersistError {
    failure(code, field, constraint, format!("{} must be a number", field), value)
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::Text(s) => Some(s.chars().count()),
        Value::Json(serde_json::Value::Array(items)) => Some(items.len()),
        _ => None,
    }
}

/// Compiles field options, then caller predicates, into an ordered list.
pub fn compile(fields: &FieldMap, custom: &[(String, AsyncPredicate)]) -> Result<Vec<Validator>> {
    let mut validators = Vec::new();

    for (name, def) in fields.iter() {
        let options = &def.options;
        if options.required {
            validators.push(Validator::new(name, Rule::Required));
        }
        if let Some(min) = options.min {
            validators.push(Validator::new(name, Rule::Min(min)));
        }
        if let Some(max) = options.max {
            validators.push(Validator::new(name, Rule::Max(max)));
        }
        if let Some(min) = options.min_length {
            validators.push(Validator::new(name, Rule::MinLength(min)));
        }
        if let Some(max) = options.max_length {
            validators.push(Validator::new(name, Rule::MaxLength(max)));
        }
        if let Some(pattern) = &options.pattern {
            let re = Regex::new(pattern).map_err(|err| {
                PersistError::configuration(
                    ErrorCode::InvalidConfig,
                    format!("Invalid pattern for field '{}': {}", name, err),
                )
                .with_detail("field", name)
            })?;
            validators.push(Validator::new(name, Rule::Pattern(re)));
        }
    }

    for (field, predicate) in custom {
        validators.push(Validator::new(field.clone(), Rule::Custom(predicate.clone())));
    }

    Ok(validators)
}

/// Runs validators in order and stops at the first failure.
pub async fn run<F>(validators: &[Validator], lookup: F) -> Result<()>
where
    F: Fn(&str) -> Value,
{
    for validator in validators {
        let value = lookup(&validator.field);
        if let Some(err) = validator.check(&value).await {
            return Err(err);
        }
    }
    Ok(())
}

/// Generic check used when a type has no compiled validators: every field
/// flagged required (or as primary key) must carry a value.
pub fn required_scan<F>(fields: &FieldMap, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Value,
{
    for (name, def) in fields.iter() {
        if !def.is_required() || !def.kind.is_column() {
            continue;
        }
        let value = lookup(name);
        if value.is_blank() {
            return Err(failure(
                ErrorCode::Required,
                name,
                "required",
                format!("{} is required", name),
                &value,
            ));
        }
    }
    Ok(())
}
