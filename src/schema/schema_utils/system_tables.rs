/// Names and DDL of the per-connection system tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemTables {
    prefix: String,
}

impl SystemTables {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn context_memory(&self) -> String {
        format!("{}context_memory", self.prefix)
    }

    pub fn schema_versions(&self) -> String {
        format!("{}schema_versions", self.prefix)
    }

    pub fn registry_snapshot(&self) -> String {
        format!("{}registry_snapshot", self.prefix)
    }

    pub fn signal_log(&self) -> String {
        format!("{}signal_log", self.prefix)
    }

    pub fn all(&self) -> Vec<String> {
        vec![
            self.context_memory(),
            self.schema_versions(),
            self.registry_snapshot(),
            self.signal_log(),
        ]
    }

    /// Every system table and index as one idempotent script.
    pub fn script(&self, dialect: Dialect) -> String {
        let text = dialect.text_type();
        let json = dialect.column_type(FieldKind::Json);
        let ts = dialect.timestamp_type();
        let int = dialect.column_type(FieldKind::Integer);
        let real = dialect.column_type(FieldKind::Decimal);

        let memory = self.context_memory();
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {memory} (\
                 id {text} PRIMARY KEY, \
                 owner_type {text} NOT NULL, \
                 owner_id {text} NOT NULL, \
                 scope {text} NOT NULL, \
                 key {text} NOT NULL, \
                 value {json}, \
                 metadata {json}, \
                 version {int} NOT NULL DEFAULT 1, \
                 confidence {real} NOT NULL DEFAULT 1.0, \
                 created_at {ts} NOT NULL, \
                 updated_at {ts} NOT NULL, \
                 last_used_at {ts}, \
                 expires_at {ts}, \
                 UNIQUE (owner_type, owner_id, scope, key, version))"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {memory} (owner_type, owner_id, scope)",
                default_index_name(&memory, "owner")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 table_name {text} PRIMARY KEY, \
                 schema_hash {text} NOT NULL, \
                 ddl {text} NOT NULL, \
                 applied_at {ts} NOT NULL)",
                self.schema_versions()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 type_name {text} PRIMARY KEY, \
                 table_name {text} NOT NULL, \
                 fields_json {json} NOT NULL, \
                 relationships_json {json} NOT NULL, \
                 updated_at {ts} NOT NULL)",
                self.registry_snapshot()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 id {text} PRIMARY KEY, \
                 type_name {text} NOT NULL, \
                 entity_id {text} NOT NULL, \
                 signal {text} NOT NULL, \
                 payload {json}, \
                 created_at {ts} NOT NULL)",
                self.signal_log()
            ),
        ];
        statements.join(";\n")
    }
}
