lazy_static! {
    static ref IDENTIFIER_PATTERN: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    static ref SLUG_SEPARATORS: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

/// True when `name` is usable as a table or column name.
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(name)
}

/// Sanitizes a string for use as a SQL identifier (table/column name).
///
/// Converts non-alphanumeric characters to underscores and lowercases the result.
pub fn sanitize_sql_identifier(input: &str) -> String {
    let mut sanitized = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            sanitized.push(ch.to_ascii_lowercase());
        } else {
            sanitized.push('_');
        }
    }
    if sanitized.starts_with(|ch: char| ch.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

/// Default table name for a type: `ProductCategory` becomes `product_category`.
pub fn default_table_name(type_name: &str) -> String {
    let mut snake = String::with_capacity(type_name.len() + 4);
    let mut prev_lower_or_digit = false;
    for ch in type_name.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower_or_digit {
                snake.push('_');
            }
            prev_lower_or_digit = false;
        } else {
            prev_lower_or_digit = ch.is_ascii_alphanumeric();
        }
        snake.push(ch);
    }
    sanitize_sql_identifier(&snake)
}

/// Generates a default index name.
///
/// Format: `idx_<table>_<field>`
pub fn default_index_name(table_name: &str, field_name: &str) -> String {
    let table = sanitize_sql_identifier(table_name);
    let field = sanitize_sql_identifier(field_name);
    format!("idx_{}_{}", table, field)
}

/// Generates a new unique entity id (UUID v4).
pub fn new_entity_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lowercases, collapses non-alphanumeric runs to `-` and trims the ends.
pub fn slugify(input: &str) -> String {
    let lower = input.to_lowercase();
    SLUG_SEPARATORS
        .replace_all(&lower, "-")
        .trim_matches('-')
        .to_string()
}

/// Escapes a string for inclusion in a SQL literal.
///
/// Replaces single quotes with double single quotes.
pub fn sql_escape_string(value: &str) -> String {
    value.replace('\'', "''")
}

/// Renders a value as a SQL literal, used for column defaults.
pub fn value_to_sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => {
            let rendered = f.to_string();
            if rendered.contains('.') || rendered.contains('e') {
                rendered
            } else {
                format!("{}.0", rendered)
            }
        }
        Value::Float(_) => "NULL".to_string(),
        Value::Boolean(true) => "TRUE".to_string(),
        Value::Boolean(false) => "FALSE".to_string(),
        Value::Text(s) => format!("'{}'", sql_escape_string(s)),
        Value::Timestamp(ts) => format!("'{}'", timestamp_to_storage(ts)),
        Value::Json(json) => format!("'{}'", sql_escape_string(&json.to_string())),
    }
}
