/// Columns implied by the default identity mode, in DDL order.
pub const DEFAULT_IDENTITY_COLUMNS: &[&str] = &["id", "slug", "context", "name"];

/// DDL and layout for one entity table.
///
/// Cached by the registry behind an `Arc` and replaced wholesale on
/// regeneration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedSchema {
    pub type_name: String,
    pub table_name: String,
    pub ddl: String,
    pub indexes: Vec<String>,
    /// Every column in DDL order.
    pub columns: Vec<String>,
    /// Custom primary-key field, when one is declared.
    pub primary_key: Option<String>,
}

impl GeneratedSchema {
    pub fn uses_default_identity(&self) -> bool {
        self.primary_key.is_none()
    }

    /// Column holding the row identity.
    pub fn key_column(&self) -> &str {
        self.primary_key.as_deref().unwrap_or("id")
    }

    /// Columns the upsert resolves conflicts on.
    pub fn conflict_columns(&self) -> Vec<&str> {
        match &self.primary_key {
            Some(pk) => vec![pk.as_str()],
            None => vec!["slug", "context"],
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Table and index statements as one `;`-separated script.
    pub fn script(&self) -> String {
        let mut statements = Vec::with_capacity(self.indexes.len() + 1);
        statements.push(self.ddl.clone());
        statements.extend(self.indexes.iter().cloned());
        statements.join(";\n")
    }

    /// Stable hash of the full script (UUID v5), recorded in the schema log.
    pub fn schema_hash(&self) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, self.script().as_bytes())
            .simple()
            .to_string()
    }
}

/// Generates the table for `type_name` under its default table name.
pub fn generate(type_name: &str, fields: &FieldMap, dialect: Dialect) -> Result<GeneratedSchema> {
    generate_for_table(type_name, &default_table_name(type_name), fields, dialect)
}

pub fn generate_for_table(
    type_name: &str,
    table_name: &str,
    fields: &FieldMap,
    dialect: Dialect,
) -> Result<GeneratedSchema> {
    if !is_valid_identifier(table_name) {
        return Err(invalid_identifier(type_name, table_name, "table name"));
    }

    let primary_key = resolve_primary_key(type_name, fields)?;
    let text = dialect.text_type();
    let timestamp = dialect.timestamp_type();
    let q = |name: &str| dialect.quote_ident(name);

    let mut columns: Vec<String> = Vec::new();
    let mut definitions: Vec<String> = Vec::new();

    if primary_key.is_none() {
        definitions.push(format!("{} {} PRIMARY KEY", q("id"), text));
        definitions.push(format!("{} {} NOT NULL", q("slug"), text));
        definitions.push(format!("{} {} NOT NULL DEFAULT ''", q("context"), text));
        columns.extend(["id", "slug", "context"].map(String::from));
        if !fields.contains("name") {
            definitions.push(format!("{} {} DEFAULT ''", q("name"), text));
            columns.push("name".to_string());
        }
    }

    for (name, def) in fields.iter() {
        if !def.kind.is_column() || is_created_at(name) || is_updated_at(name) {
            continue;
        }
        if primary_key.is_none() && matches!(name, "id" | "slug" | "context") {
            continue;
        }
        if !is_valid_identifier(name) {
            return Err(invalid_identifier(type_name, name, "field name"));
        }
        if def.kind == FieldKind::ForeignKey && def.options.related.is_none() {
            return Err(PersistError::configuration(
                ErrorCode::UnknownRelationship,
                format!("Field '{}.{}' is a foreign key without a target type", type_name, name),
            )
            .with_detail("type_name", type_name)
            .with_detail("field", name));
        }

        let is_pk = primary_key.as_deref() == Some(name);
        definitions.push(column_definition(name, def, is_pk, dialect));
        columns.push(name.to_string());
    }

    definitions.push(format!("{} {} NOT NULL", q("created_at"), timestamp));
    definitions.push(format!("{} {} NOT NULL", q("updated_at"), timestamp));
    columns.extend(["created_at", "updated_at"].map(String::from));

    if primary_key.is_none() {
        definitions.push(format!("UNIQUE ({}, {})", q("slug"), q("context")));
    }

    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        q(table_name),
        definitions.join(", ")
    );

    let mut indexes = Vec::new();
    if let Some(pk) = &primary_key {
        indexes.push(index_statement(table_name, pk, dialect));
    }
    for (name, def) in fields.iter() {
        let wants_index = def.kind == FieldKind::ForeignKey || def.options.indexed;
        if wants_index && def.kind.is_column() && primary_key.as_deref() != Some(name) {
            indexes.push(index_statement(table_name, name, dialect));
        }
    }

    Ok(GeneratedSchema {
        type_name: type_name.to_string(),
        table_name: table_name.to_string(),
        ddl,
        indexes,
        columns,
        primary_key,
    })
}

fn resolve_primary_key(type_name: &str, fields: &FieldMap) -> Result<Option<String>> {
    let keys: Vec<&str> = fields
        .iter()
        .filter(|(_, def)| def.options.primary_key)
        .map(|(name, _)| name)
        .collect();

    match keys.as_slice() {
        [] => Ok(None),
        [single] => Ok(Some(single.to_string())),
        _ => Err(PersistError::configuration(
            ErrorCode::InvalidConfig,
            format!(
                "Type '{}' declares more than one primary key: {}",
                type_name,
                keys.join(", ")
            ),
        )
        .with_detail("type_name", type_name)),
    }
}

fn column_definition(name: &str, def: &FieldDef, is_pk: bool, dialect: Dialect) -> String {
    let mut column = format!("{} {}", dialect.quote_ident(name), dialect.column_type(def.kind));
    if is_pk {
        column.push_str(" PRIMARY KEY");
        return column;
    }
    if def.options.required {
        column.push_str(" NOT NULL");
    }
    match &def.options.default {
        Some(default) => {
            column.push_str(" DEFAULT ");
            column.push_str(&value_to_sql_literal(default));
        }
        None if def.kind == FieldKind::Text => column.push_str(" DEFAULT ''"),
        None => {}
    }
    column
}

fn index_statement(table_name: &str, column: &str, dialect: Dialect) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        default_index_name(table_name, column),
        dialect.quote_ident(table_name),
        dialect.quote_ident(column)
    )
}

fn invalid_identifier(type_name: &str, name: &str, what: &str) -> PersistError {
    PersistError::configuration(
        ErrorCode::InvalidIdentifier,
        format!("Invalid {} '{}' on type '{}'", what, name, type_name),
    )
    .with_detail("type_name", type_name)
    .with_detail("identifier", name)
}
