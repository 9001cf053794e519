//! Typed filters and their compilation to parameterised SQL.
//!
//! Field names and ORDER BY terms are interpolated, so both are checked
//! against the identifier pattern first; values always travel as
//! parameters.

use crate::core::{ErrorCode, PersistError, Record, Result, ValidationError, Value};
use crate::schema::is_valid_identifier;
use crate::storage::Dialect;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UUID_PATTERN: Regex = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
    )
    .unwrap();
}

/// True for strings shaped like a canonical UUID.
pub fn looks_like_id(candidate: &str) -> bool {
    UUID_PATTERN.is_match(candidate)
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Like(String),
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub expr: FilterExpr,
}

/// Conjunction of conditions, compiled in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn push(mut self, field: impl Into<String>, expr: FilterExpr) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            expr,
        });
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterExpr::Eq(value.into()))
    }

    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterExpr::Ne(value.into()))
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterExpr::Gt(value.into()))
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterExpr::Gte(value.into()))
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterExpr::Lt(value.into()))
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(field, FilterExpr::Lte(value.into()))
    }

    pub fn is_in<V: Into<Value>>(self, field: impl Into<String>, values: Vec<V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.push(field, FilterExpr::In(values))
    }

    pub fn not_in<V: Into<Value>>(self, field: impl Into<String>, values: Vec<V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.push(field, FilterExpr::NotIn(values))
    }

    pub fn like(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.push(field, FilterExpr::Like(pattern.into()))
    }

    pub fn is_null(self, field: impl Into<String>) -> Self {
        self.push(field, FilterExpr::IsNull)
    }

    pub fn is_not_null(self, field: impl Into<String>) -> Self {
        self.push(field, FilterExpr::IsNotNull)
    }

    /// Equality on every entry of a record, in key order.
    pub fn matching(record: &Record) -> Self {
        record
            .iter()
            .fold(Filter::new(), |filter, (field, value)| filter.eq(field.as_str(), value.clone()))
    }

    /// Parses `"field op"` keys such as `"price >"`, `"status in"`,
    /// `"deleted_at"` (equality). Pairs compile in the given order.
    pub fn from_pairs<K, I>(pairs: I) -> Result<Self>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut filter = Filter::new();
        for (key, value) in pairs {
            let (field, op) = split_operator(key.as_ref());
            let expr = match (op.as_str(), value) {
                ("=" | "==", value) => FilterExpr::Eq(value),
                ("!=" | "<>", value) => FilterExpr::Ne(value),
                (">", value) => FilterExpr::Gt(value),
                (">=", value) => FilterExpr::Gte(value),
                ("<", value) => FilterExpr::Lt(value),
                ("<=", value) => FilterExpr::Lte(value),
                ("in", value) => FilterExpr::In(list_values(field, value)?),
                ("not in", value) => FilterExpr::NotIn(list_values(field, value)?),
                ("like", Value::Text(pattern)) => FilterExpr::Like(pattern),
                ("is null", _) => FilterExpr::IsNull,
                ("is not null", _) => FilterExpr::IsNotNull,
                (other, _) => {
                    return Err(PersistError::validation(
                        ErrorCode::InvalidOperator,
                        ValidationError::new(
                            field,
                            "operator",
                            format!("Unsupported filter operator '{}'", other),
                        ),
                    ));
                }
            };
            filter = filter.push(field, expr);
        }
        Ok(filter)
    }
}

fn split_operator(key: &str) -> (&str, String) {
    let key = key.trim();
    match key.split_once(char::is_whitespace) {
        Some((field, op)) => {
            let op = op.split_whitespace().collect::<Vec<_>>().join(" ");
            (field, op.to_lowercase())
        }
        None => (key, "=".to_string()),
    }
}

fn list_values(field: &str, value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Json(serde_json::Value::Array(items)) => {
            Ok(items.into_iter().map(Value::from_json).collect())
        }
        other => Err(PersistError::validation(
            ErrorCode::InvalidOperator,
            ValidationError::new(field, "operator", "IN filters need a list of values")
                .with_value(other),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }

    /// Parses `"field"`, `"field ASC"` or `"field desc"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parts = raw.split_whitespace();
        let field = parts.next().unwrap_or_default();
        let direction = match parts.next().map(str::to_ascii_uppercase).as_deref() {
            None | Some("ASC") => Direction::Asc,
            Some("DESC") => Direction::Desc,
            Some(other) => {
                return Err(invalid_order(raw, format!("Invalid sort direction '{}'", other)));
            }
        };
        if parts.next().is_some() {
            return Err(invalid_order(raw, "Unexpected tokens in ORDER BY term".to_string()));
        }
        let order = Self {
            field: field.to_string(),
            direction,
        };
        order.validate()?;
        Ok(order)
    }

    pub fn validate(&self) -> Result<()> {
        if is_valid_identifier(&self.field) {
            Ok(())
        } else {
            Err(PersistError::validation(
                ErrorCode::InvalidIdentifier,
                ValidationError::new(
                    self.field.clone(),
                    "identifier",
                    format!("'{}' is not a valid column name", self.field),
                ),
            ))
        }
    }
}

fn invalid_order(raw: &str, message: String) -> PersistError {
    PersistError::validation(
        ErrorCode::InvalidOrder,
        ValidationError::new("order_by", "order", message).with_value(Value::from(raw)),
    )
}

/// Options for `Collection::list` and `Collection::count`.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub filter: Filter,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub order_by: Vec<OrderBy>,
    /// Relationship fields to eager-load.
    pub include: Vec<String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn include(mut self, field: impl Into<String>) -> Self {
        self.include.push(field.into());
        self
    }
}

/// Compiled WHERE clause. `sql` is empty when there are no conditions,
/// otherwise it starts with `WHERE`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhereClause {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Compiles a filter; placeholders are numbered from `first_param`.
pub fn build_where(filter: &Filter, dialect: Dialect, first_param: usize) -> Result<WhereClause> {
    let mut clauses = Vec::with_capacity(filter.conditions.len());
    let mut params = Vec::new();
    let mut next = first_param;

    let mut bind = |value: Value, params: &mut Vec<Value>| {
        params.push(value);
        let placeholder = dialect.placeholder(next);
        next += 1;
        placeholder
    };

    for condition in &filter.conditions {
        let field = condition.field.as_str();
        if !is_valid_identifier(field) {
            return Err(PersistError::validation(
                ErrorCode::InvalidIdentifier,
                ValidationError::new(
                    field,
                    "identifier",
                    format!("'{}' is not a valid column name", field),
                ),
            ));
        }

        let column = dialect.quote_ident(field);
        let clause = match &condition.expr {
            FilterExpr::Eq(Value::Null) | FilterExpr::IsNull => format!("{} IS NULL", column),
            FilterExpr::Ne(Value::Null) | FilterExpr::IsNotNull => {
                format!("{} IS NOT NULL", column)
            }
            FilterExpr::Eq(v) => format!("{} = {}", column, bind(v.clone(), &mut params)),
            FilterExpr::Ne(v) => format!("{} <> {}", column, bind(v.clone(), &mut params)),
            FilterExpr::Gt(v) => format!("{} > {}", column, bind(v.clone(), &mut params)),
            FilterExpr::Gte(v) => format!("{} >= {}", column, bind(v.clone(), &mut params)),
            FilterExpr::Lt(v) => format!("{} < {}", column, bind(v.clone(), &mut params)),
            FilterExpr::Lte(v) => format!("{} <= {}", column, bind(v.clone(), &mut params)),
            FilterExpr::Like(pattern) => {
                format!("{} LIKE {}", column, bind(Value::from(pattern.as_str()), &mut params))
            }
            FilterExpr::In(values) if values.is_empty() => "1 = 0".to_string(),
            FilterExpr::NotIn(values) if values.is_empty() => "1 = 1".to_string(),
            FilterExpr::In(values) | FilterExpr::NotIn(values) => {
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| bind(v.clone(), &mut params))
                    .collect();
                let op = if matches!(condition.expr, FilterExpr::In(_)) {
                    "IN"
                } else {
                    "NOT IN"
                };
                format!("{} {} ({})", column, op, placeholders.join(", "))
            }
        };
        clauses.push(clause);
    }

    let sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    Ok(WhereClause { sql, params })
}

/// Compiles validated ORDER BY terms; empty when there are none.
pub fn build_order_by(order: &[OrderBy], dialect: Dialect) -> Result<String> {
    if order.is_empty() {
        return Ok(String::new());
    }
    let mut terms = Vec::with_capacity(order.len());
    for term in order {
        term.validate()?;
        terms.push(format!(
            "{} {}",
            dialect.quote_ident(&term.field),
            term.direction.as_sql()
        ));
    }
    Ok(format!(" ORDER BY {}", terms.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_operators_in_key_order() {
        let filter = Filter::from_pairs(vec![
            ("price >", Value::from(100)),
            ("category in", Value::from(vec!["A", "B"])),
            ("deleted_at", Value::Null),
        ])
        .expect("filter");

        let clause = build_where(&filter, Dialect::Sqlite, 1).expect("where");
        assert_eq!(
            clause.sql,
            r#"WHERE "price" > ?1 AND "category" IN (?2, ?3) AND "deleted_at" IS NULL"#
        );
        assert_eq!(
            clause.params,
            vec![Value::Integer(100), Value::from("A"), Value::from("B")]
        );
    }

    #[test]
    fn null_inequality_and_not_in() {
        let filter = Filter::new()
            .ne("archived_at", Value::Null)
            .not_in("status", vec!["draft"])
            .like("name", "Wid%");
        let clause = build_where(&filter, Dialect::Postgres, 3).expect("where");
        assert_eq!(
            clause.sql,
            r#"WHERE "archived_at" IS NOT NULL AND "status" NOT IN ($3) AND "name" LIKE $4"#
        );
        assert_eq!(clause.params.len(), 2);
    }

    #[test]
    fn empty_in_matches_nothing() {
        let filter = Filter::new().push("id", FilterExpr::In(Vec::new()));
        let clause = build_where(&filter, Dialect::Sqlite, 1).expect("where");
        assert_eq!(clause.sql, "WHERE 1 = 0");
        assert!(clause.params.is_empty());
    }

    #[test]
    fn operator_parsing_is_case_and_space_insensitive() {
        let filter = Filter::from_pairs(vec![
            ("status  NOT   IN", Value::from(vec!["x"])),
            ("qty <>", Value::from(0)),
        ])
        .expect("filter");
        assert!(matches!(filter.conditions()[0].expr, FilterExpr::NotIn(_)));
        assert!(matches!(filter.conditions()[1].expr, FilterExpr::Ne(_)));
    }

    #[test]
    fn rejects_unknown_operators_and_bad_fields() {
        let err = Filter::from_pairs(vec![("price ~", Value::from(1))]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOperator);

        let err = Filter::from_pairs(vec![("tags in", Value::from("a"))]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidOperator);

        let filter = Filter::new().eq("name; DROP TABLE x", 1);
        let err = build_where(&filter, Dialect::Sqlite, 1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidIdentifier);
    }

    #[test]
    fn order_by_rejects_injection() {
        assert_eq!(
            build_order_by(
                &[OrderBy::parse("price desc").expect("order"), OrderBy::asc("name")],
                Dialect::Sqlite
            )
            .expect("order"),
            r#" ORDER BY "price" DESC, "name" ASC"#
        );
        assert_eq!(
            OrderBy::parse("price; DROP TABLE products").unwrap_err().code(),
            ErrorCode::InvalidOrder
        );
        assert_eq!(
            OrderBy::parse("price SIDEWAYS").unwrap_err().code(),
            ErrorCode::InvalidOrder
        );
        assert_eq!(
            OrderBy::parse("1=1").unwrap_err().code(),
            ErrorCode::InvalidIdentifier
        );
        assert!(build_order_by(&[OrderBy::asc("bad name")], Dialect::Sqlite).is_err());
    }

    #[test]
    fn recognises_canonical_ids() {
        assert!(looks_like_id("5f0c6a7e-8d1b-4c3e-9a2f-0b1c2d3e4f50"));
        assert!(!looks_like_id("my-product"));
    }
}
