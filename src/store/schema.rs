//! Compiled user schema description.
//!
//! The table builder DSL is an external collaborator; the engine receives
//! its output as `TableSchema` values and derives all physical DDL from
//! them: `{instance_id}__T` for live data, `{instance_id}_reorg__T` for the
//! journal, and the unprefixed public view.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("table name {0} is reserved")]
    ReservedName(String),

    #[error("table {0} declares no primary key")]
    NoPrimaryKey(String),

    #[error("table {0} declared twice")]
    DuplicateTable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Text,
    Integer,
    Double,
    Boolean,
    Json,
}

impl ColumnKind {
    /// SQL type valid in both supported dialects.
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Text => "TEXT",
            ColumnKind::Integer => "BIGINT",
            ColumnKind::Double => "DOUBLE PRECISION",
            // Stored as 0/1 so both dialects agree on representation.
            ColumnKind::Boolean => "INTEGER",
            ColumnKind::Json => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl Column {
    pub fn new(name: &str, kind: ColumnKind) -> Self {
        Column {
            name: name.to_string(),
            kind,
            nullable: false,
            primary_key: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    /// Only onchain tables accept writes from event handlers.
    pub onchain: bool,
}

impl TableSchema {
    pub fn primary_key_columns(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn physical_name(&self, instance_id: &str) -> String {
        format!("{instance_id}__{}", self.name)
    }

    pub fn journal_name(&self, instance_id: &str) -> String {
        format!("{instance_id}_reorg__{}", self.name)
    }

    pub fn create_physical_sql(&self, instance_id: &str) -> String {
        let mut definitions: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let null = if c.nullable { "" } else { " NOT NULL" };
                format!("\"{}\" {}{}", c.name, c.kind.sql_type(), null)
            })
            .collect();
        let pk: Vec<String> = self
            .primary_key_columns()
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .collect();
        definitions.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            self.physical_name(instance_id),
            definitions.join(", ")
        )
    }

    /// The shadow journal. `seq` is allocated by the store so descending
    /// replay is total even within one checkpoint.
    pub fn create_journal_sql(&self, instance_id: &str) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                seq BIGINT NOT NULL,
                operation TEXT NOT NULL,
                checkpoint TEXT NOT NULL,
                row_key TEXT NOT NULL,
                before_image TEXT,
                PRIMARY KEY (seq)
            )",
            self.journal_name(instance_id)
        )
    }

    pub fn journal_index_sql(&self, instance_id: &str) -> String {
        format!(
            "CREATE INDEX IF NOT EXISTS \"idx_{0}_checkpoint\" ON \"{0}\"(checkpoint)",
            self.journal_name(instance_id)
        )
    }

    pub fn drop_view_sql(&self) -> String {
        format!("DROP VIEW IF EXISTS \"{}\"", self.name)
    }

    pub fn create_view_sql(&self, instance_id: &str) -> String {
        format!(
            "CREATE VIEW \"{}\" AS SELECT * FROM \"{}\"",
            self.name,
            self.physical_name(instance_id)
        )
    }
}

/// Names an instance may not shadow with a view or table.
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with('_')
        || name.starts_with("sync_")
        || name.contains("__")
        || name.is_empty()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSchema {
    pub tables: Vec<TableSchema>,
}

impl UserSchema {
    pub fn new(tables: Vec<TableSchema>) -> Result<Self, SchemaError> {
        let mut seen = std::collections::HashSet::new();
        for table in &tables {
            if is_reserved_name(&table.name) {
                return Err(SchemaError::ReservedName(table.name.clone()));
            }
            if table.primary_key_columns().is_empty() {
                return Err(SchemaError::NoPrimaryKey(table.name.clone()));
            }
            if !seen.insert(table.name.clone()) {
                return Err(SchemaError::DuplicateTable(table.name.clone()));
            }
        }
        Ok(UserSchema { tables })
    }

    pub fn get(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn onchain_tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.iter().filter(|t| t.onchain)
    }

    /// Deterministic digest; one input of the build id.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(&self.tables).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        alloy_primitives::hex::encode(&hasher.finalize()[..8])
    }
}
