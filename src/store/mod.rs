//! The write API exposed to user handlers.
//!
//! Plain async methods returning concrete results: `find`, `insert`,
//! `insert_many`, `update`, `delete`, plus a read-only `sql` escape hatch.
//! Rows travel as JSON objects shaped by the compiled schema. Every write
//! inserts its journal row in the same database transaction, and a mutex
//! serializes operations so find-then-update inside a handler is race-free.

pub mod journal;
pub mod schema;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use serde_json::{Map, Value};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column as _, Row as _};
use thiserror::Error;

use crate::checkpoint::Checkpoint;
use crate::db::Database;
use crate::store::journal::JournalOp;
use crate::store::schema::{Column, ColumnKind, TableSchema, UserSchema};

pub type Row = Map<String, Value>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("table {0} is not declared in the schema")]
    UndefinedTable(String),

    #[error("invalid store method: {0}")]
    InvalidStoreMethod(String),

    #[error("no row in {table} for key {key}")]
    RecordNotFound { table: String, key: String },

    #[error("unique constraint violated on {0}")]
    UniqueConstraint(String),

    #[error("not-null constraint violated on {0}")]
    NotNullConstraint(String),

    #[error("check constraint violated on {0}")]
    CheckConstraint(String),

    #[error("column {column} of {table}: {detail}")]
    InvalidValue {
        table: String,
        column: String,
        detail: String,
    },

    #[error("invalid key for {table}: {detail}")]
    InvalidKey { table: String, detail: String },

    #[error("database error: {0}")]
    Db(sqlx::Error),
}

impl StoreError {
    fn from_sqlx(table: &str, error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &error {
            use sqlx::error::ErrorKind;
            match db.kind() {
                ErrorKind::UniqueViolation => {
                    return StoreError::UniqueConstraint(table.to_string())
                }
                ErrorKind::NotNullViolation => {
                    return StoreError::NotNullConstraint(table.to_string())
                }
                ErrorKind::CheckViolation => {
                    return StoreError::CheckConstraint(table.to_string())
                }
                _ => {}
            }
        }
        StoreError::Db(error)
    }
}

/// Conflict policy for inserts.
#[derive(Debug, Clone)]
pub enum OnConflict {
    /// Surface the constraint violation.
    Error,
    DoNothing,
    /// Merge the given columns into the existing row.
    DoUpdate(Row),
}

pub struct IndexingStore {
    pool: AnyPool,
    instance_id: String,
    schema: UserSchema,
    /// Primary key column names per table, resolved once at construction.
    primary_keys: HashMap<String, Vec<String>>,
    /// Serializes all store operations within a handler invocation.
    lock: tokio::sync::Mutex<()>,
    /// Checkpoint of the event currently being indexed; stamped on journal
    /// rows.
    checkpoint: RwLock<Checkpoint>,
    journal_seq: AtomicI64,
}

impl IndexingStore {
    /// Build the store, creating physical and journal tables as needed and
    /// seeding the journal sequence past any rows a resumed instance left.
    pub async fn attach(
        database: &Database,
        instance_id: &str,
        schema: UserSchema,
    ) -> Result<Self, StoreError> {
        let pool = database.pool().clone();
        let mut primary_keys = HashMap::new();
        for table in &schema.tables {
            primary_keys.insert(
                table.name.clone(),
                table
                    .primary_key_columns()
                    .iter()
                    .map(|c| c.name.clone())
                    .collect(),
            );
        }

        for table in &schema.tables {
            sqlx::query(&table.create_physical_sql(instance_id))
                .execute(&pool)
                .await
                .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
            if table.onchain {
                sqlx::query(&table.create_journal_sql(instance_id))
                    .execute(&pool)
                    .await
                    .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
                sqlx::query(&table.journal_index_sql(instance_id))
                    .execute(&pool)
                    .await
                    .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
            }
        }

        let mut next_seq: i64 = 0;
        for table in schema.onchain_tables() {
            let max: Option<i64> = sqlx::query_scalar(&format!(
                "SELECT MAX(seq) FROM \"{}\"",
                table.journal_name(instance_id)
            ))
            .fetch_one(&pool)
            .await
            .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
            next_seq = next_seq.max(max.unwrap_or(-1) + 1);
        }

        Ok(IndexingStore {
            pool,
            instance_id: instance_id.to_string(),
            schema,
            primary_keys,
            lock: tokio::sync::Mutex::new(()),
            checkpoint: RwLock::new(Checkpoint::ZERO),
            journal_seq: AtomicI64::new(next_seq),
        })
    }

    pub fn schema(&self) -> &UserSchema {
        &self.schema
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Called by the runner before each handler invocation.
    pub fn set_checkpoint(&self, checkpoint: Checkpoint) {
        *self.checkpoint.write().expect("checkpoint lock") = checkpoint;
    }

    pub fn checkpoint(&self) -> Checkpoint {
        *self.checkpoint.read().expect("checkpoint lock")
    }

    fn table(&self, name: &str) -> Result<&TableSchema, StoreError> {
        self.schema
            .get(name)
            .ok_or_else(|| StoreError::UndefinedTable(name.to_string()))
    }

    fn writable_table(&self, name: &str) -> Result<&TableSchema, StoreError> {
        let table = self.table(name)?;
        if !table.onchain {
            return Err(StoreError::InvalidStoreMethod(format!(
                "table {name} is offchain and cannot be written from handlers"
            )));
        }
        Ok(table)
    }

    /// Normalize a key (bare scalar for single-column keys, object
    /// otherwise) into (column, value) pairs in primary-key order.
    fn key_pairs(&self, table: &TableSchema, key: &Value) -> Result<Vec<(String, Value)>, StoreError> {
        let pk = &self.primary_keys[&table.name];
        match key {
            Value::Object(map) => pk
                .iter()
                .map(|column| {
                    map.get(column)
                        .cloned()
                        .map(|v| (column.clone(), v))
                        .ok_or_else(|| StoreError::InvalidKey {
                            table: table.name.clone(),
                            detail: format!("missing key column {column}"),
                        })
                })
                .collect(),
            scalar => {
                if pk.len() != 1 {
                    return Err(StoreError::InvalidKey {
                        table: table.name.clone(),
                        detail: format!("composite key requires an object, got {scalar}"),
                    });
                }
                Ok(vec![(pk[0].clone(), scalar.clone())])
            }
        }
    }

    fn row_key(pairs: &[(String, Value)]) -> String {
        let values: Vec<&Value> = pairs.iter().map(|(_, v)| v).collect();
        serde_json::to_string(&values).expect("json values always serialize")
    }

    pub async fn find(&self, table_name: &str, key: &Value) -> Result<Option<Row>, StoreError> {
        let _guard = self.lock.lock().await;
        let table = self.table(table_name)?;
        let pairs = self.key_pairs(table, key)?;
        find_in(&self.pool, table, &self.instance_id, &pairs).await
    }

    /// Insert one row. Returns the stored row, or `None` when the conflict
    /// policy skipped the write.
    pub async fn insert(
        &self,
        table_name: &str,
        values: Row,
        on_conflict: OnConflict,
    ) -> Result<Option<Row>, StoreError> {
        let _guard = self.lock.lock().await;
        self.insert_locked(table_name, values, &on_conflict).await
    }

    /// Insert a batch under one conflict policy, in one database
    /// transaction per row write. With `DoUpdate`, each row resolves with a
    /// find-then-write; the upsert is not atomic across the batch with
    /// respect to concurrent readers of the public view.
    pub async fn insert_many(
        &self,
        table_name: &str,
        rows: Vec<Row>,
        on_conflict: OnConflict,
    ) -> Result<Vec<Row>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut written = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(stored) = self.insert_locked(table_name, row, &on_conflict).await? {
                written.push(stored);
            }
        }
        Ok(written)
    }

    async fn insert_locked(
        &self,
        table_name: &str,
        values: Row,
        on_conflict: &OnConflict,
    ) -> Result<Option<Row>, StoreError> {
        let table = self.writable_table(table_name)?;
        let key_value = self.key_from_values(table, &values)?;
        let pairs = self.key_pairs(table, &key_value)?;
        let row_key = Self::row_key(&pairs);
        let checkpoint = self.checkpoint();

        let mut tx = self.pool.begin().await.map_err(StoreError::Db)?;

        let existing = find_with(&mut tx, table, &self.instance_id, &pairs).await?;
        let stored = match (existing, on_conflict) {
            (None, _) => {
                insert_row(&mut tx, table, &self.instance_id, &values).await?;
                journal::record(
                    &mut tx,
                    table,
                    &self.instance_id,
                    self.next_seq(),
                    JournalOp::Insert,
                    checkpoint,
                    &row_key,
                    None,
                )
                .await?;
                Some(normalize_row(table, values)?)
            }
            (Some(_), OnConflict::Error) => {
                return Err(StoreError::UniqueConstraint(table.name.clone()));
            }
            (Some(_), OnConflict::DoNothing) => None,
            (Some(before), OnConflict::DoUpdate(set)) => {
                let mut merged = before.clone();
                for (column, value) in set {
                    merged.insert(column.clone(), value.clone());
                }
                update_row(&mut tx, table, &self.instance_id, &pairs, &merged).await?;
                journal::record(
                    &mut tx,
                    table,
                    &self.instance_id,
                    self.next_seq(),
                    JournalOp::Update,
                    checkpoint,
                    &row_key,
                    Some(&before),
                )
                .await?;
                Some(merged)
            }
        };

        tx.commit().await.map_err(StoreError::Db)?;
        Ok(stored)
    }

    /// Update an existing row, merging `set` over it. Fails with
    /// `RecordNotFound` when no row matches the key.
    pub async fn update(&self, table_name: &str, key: &Value, set: Row) -> Result<Row, StoreError> {
        let _guard = self.lock.lock().await;
        let table = self.writable_table(table_name)?;
        let pairs = self.key_pairs(table, key)?;
        let row_key = Self::row_key(&pairs);
        let checkpoint = self.checkpoint();

        let mut tx = self.pool.begin().await.map_err(StoreError::Db)?;
        let before = find_with(&mut tx, table, &self.instance_id, &pairs)
            .await?
            .ok_or_else(|| StoreError::RecordNotFound {
                table: table.name.clone(),
                key: row_key.clone(),
            })?;
        let mut merged = before.clone();
        for (column, value) in set {
            merged.insert(column, value);
        }
        update_row(&mut tx, table, &self.instance_id, &pairs, &merged).await?;
        journal::record(
            &mut tx,
            table,
            &self.instance_id,
            self.next_seq(),
            JournalOp::Update,
            checkpoint,
            &row_key,
            Some(&before),
        )
        .await?;
        tx.commit().await.map_err(StoreError::Db)?;
        Ok(merged)
    }

    /// Delete by key. Returns whether a row existed.
    pub async fn delete(&self, table_name: &str, key: &Value) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let table = self.writable_table(table_name)?;
        let pairs = self.key_pairs(table, key)?;
        let row_key = Self::row_key(&pairs);
        let checkpoint = self.checkpoint();

        let mut tx = self.pool.begin().await.map_err(StoreError::Db)?;
        let Some(before) = find_with(&mut tx, table, &self.instance_id, &pairs).await? else {
            tx.commit().await.map_err(StoreError::Db)?;
            return Ok(false);
        };
        let where_clause = where_key(&pairs, 1);
        let sql = format!(
            "DELETE FROM \"{}\" WHERE {}",
            table.physical_name(&self.instance_id),
            where_clause
        );
        let mut query = sqlx::query(&sql);
        for (column_name, value) in &pairs {
            let column = table.column(column_name).expect("key column exists");
            query = bind_value(query, table, column, value)?;
        }
        query
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
        journal::record(
            &mut tx,
            table,
            &self.instance_id,
            self.next_seq(),
            JournalOp::Delete,
            checkpoint,
            &row_key,
            Some(&before),
        )
        .await?;
        tx.commit().await.map_err(StoreError::Db)?;
        Ok(true)
    }

    /// Read-only escape hatch: a single SELECT statement. Anything else is
    /// rejected before reaching the database, because writes outside the
    /// typed API would not be journaled.
    pub async fn sql(&self, query: &str) -> Result<Vec<Row>, StoreError> {
        let trimmed = query.trim().trim_end_matches(';').trim();
        if trimmed.contains(';') {
            return Err(StoreError::InvalidStoreMethod(
                "sql accepts a single statement".into(),
            ));
        }
        if !trimmed.to_lowercase().starts_with("select") {
            return Err(StoreError::InvalidStoreMethod(
                "sql is read-only; use the typed write methods".into(),
            ));
        }
        let _guard = self.lock.lock().await;
        let rows = sqlx::query(trimmed)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Db)?;
        Ok(rows.iter().map(dynamic_row_to_json).collect())
    }

    fn next_seq(&self) -> i64 {
        self.journal_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Extract the primary key from a full row of values.
    fn key_from_values(&self, table: &TableSchema, values: &Row) -> Result<Value, StoreError> {
        let pk = &self.primary_keys[&table.name];
        let mut key = Map::new();
        for column in pk {
            let value = values.get(column).ok_or_else(|| StoreError::InvalidKey {
                table: table.name.clone(),
                detail: format!("insert values missing key column {column}"),
            })?;
            key.insert(column.clone(), value.clone());
        }
        Ok(Value::Object(key))
    }
}

/// `"a" = $1 AND "b" = $2`, starting placeholders at `first`.
fn where_key(pairs: &[(String, Value)], first: usize) -> String {
    pairs
        .iter()
        .enumerate()
        .map(|(i, (column, _))| format!("\"{column}\" = ${}", first + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

async fn find_in(
    pool: &AnyPool,
    table: &TableSchema,
    instance_id: &str,
    pairs: &[(String, Value)],
) -> Result<Option<Row>, StoreError> {
    let sql = format!(
        "SELECT * FROM \"{}\" WHERE {}",
        table.physical_name(instance_id),
        where_key(pairs, 1)
    );
    let mut query = sqlx::query(&sql);
    for (column_name, value) in pairs {
        let column = table.column(column_name).expect("key column exists");
        query = bind_value(query, table, column, value)?;
    }
    let row = query
        .fetch_optional(pool)
        .await
        .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
    row.map(|r| row_to_json(table, &r)).transpose()
}

async fn find_with(
    tx: &mut sqlx::Transaction<'_, Any>,
    table: &TableSchema,
    instance_id: &str,
    pairs: &[(String, Value)],
) -> Result<Option<Row>, StoreError> {
    let sql = format!(
        "SELECT * FROM \"{}\" WHERE {}",
        table.physical_name(instance_id),
        where_key(pairs, 1)
    );
    let mut query = sqlx::query(&sql);
    for (column_name, value) in pairs {
        let column = table.column(column_name).expect("key column exists");
        query = bind_value(query, table, column, value)?;
    }
    let row = query
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
    row.map(|r| row_to_json(table, &r)).transpose()
}

async fn insert_row(
    tx: &mut sqlx::Transaction<'_, Any>,
    table: &TableSchema,
    instance_id: &str,
    values: &Row,
) -> Result<(), StoreError> {
    let columns: Vec<&Column> = table.columns.iter().collect();
    let names: Vec<String> = columns.iter().map(|c| format!("\"{}\"", c.name)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    let sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        table.physical_name(instance_id),
        names.join(", "),
        placeholders.join(", ")
    );
    let mut query = sqlx::query(&sql);
    for column in &columns {
        let value = values.get(&column.name).unwrap_or(&Value::Null);
        query = bind_value(query, table, column, value)?;
    }
    query
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
    Ok(())
}

async fn update_row(
    tx: &mut sqlx::Transaction<'_, Any>,
    table: &TableSchema,
    instance_id: &str,
    pairs: &[(String, Value)],
    merged: &Row,
) -> Result<(), StoreError> {
    let non_key: Vec<&Column> = table
        .columns
        .iter()
        .filter(|c| !c.primary_key)
        .collect();
    if non_key.is_empty() {
        return Ok(());
    }
    let assignments: Vec<String> = non_key
        .iter()
        .enumerate()
        .map(|(i, c)| format!("\"{}\" = ${}", c.name, i + 1))
        .collect();
    let sql = format!(
        "UPDATE \"{}\" SET {} WHERE {}",
        table.physical_name(instance_id),
        assignments.join(", "),
        where_key(pairs, non_key.len() + 1)
    );
    let mut query = sqlx::query(&sql);
    for column in &non_key {
        let value = merged.get(&column.name).unwrap_or(&Value::Null);
        query = bind_value(query, table, column, value)?;
    }
    for (column_name, value) in pairs {
        let column = table.column(column_name).expect("key column exists");
        query = bind_value(query, table, column, value)?;
    }
    query
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
    Ok(())
}

/// Bind one JSON value according to its declared column kind.
fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    table: &TableSchema,
    column: &Column,
    value: &Value,
) -> Result<Query<'q, Any, AnyArguments<'q>>, StoreError> {
    let mismatch = |detail: &str| StoreError::InvalidValue {
        table: table.name.clone(),
        column: column.name.clone(),
        detail: detail.to_string(),
    };
    Ok(match (column.kind, value) {
        (ColumnKind::Text, Value::Null) => query.bind(Option::<String>::None),
        (ColumnKind::Text, Value::String(s)) => query.bind(s.clone()),
        (ColumnKind::Integer, Value::Null) => query.bind(Option::<i64>::None),
        (ColumnKind::Integer, Value::Number(n)) => {
            query.bind(n.as_i64().ok_or_else(|| mismatch("expected an integer"))?)
        }
        (ColumnKind::Double, Value::Null) => query.bind(Option::<f64>::None),
        (ColumnKind::Double, Value::Number(n)) => {
            query.bind(n.as_f64().ok_or_else(|| mismatch("expected a number"))?)
        }
        (ColumnKind::Boolean, Value::Null) => query.bind(Option::<i64>::None),
        (ColumnKind::Boolean, Value::Bool(b)) => query.bind(*b as i64),
        (ColumnKind::Json, Value::Null) => query.bind(Option::<String>::None),
        (ColumnKind::Json, v) => {
            query.bind(serde_json::to_string(v).expect("json values always serialize"))
        }
        (_, v) => return Err(mismatch(&format!("incompatible value {v}"))),
    })
}

/// Decode a physical row back into its JSON shape via the schema.
pub(crate) fn row_to_json(table: &TableSchema, row: &AnyRow) -> Result<Row, StoreError> {
    let mut json = Map::new();
    for column in &table.columns {
        let name = column.name.as_str();
        let value = match column.kind {
            ColumnKind::Text => row
                .try_get::<Option<String>, _>(name)
                .map(|v| v.map(Value::String)),
            ColumnKind::Integer => row
                .try_get::<Option<i64>, _>(name)
                .map(|v| v.map(|n| Value::Number(n.into()))),
            ColumnKind::Double => row.try_get::<Option<f64>, _>(name).map(|v| {
                v.and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))
            }),
            ColumnKind::Boolean => row
                .try_get::<Option<i64>, _>(name)
                .map(|v| v.map(|n| Value::Bool(n != 0))),
            ColumnKind::Json => row.try_get::<Option<String>, _>(name).map(|v| {
                v.map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
            }),
        }
        .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
        json.insert(column.name.clone(), value.unwrap_or(Value::Null));
    }
    Ok(json)
}

/// A row written through the typed API, with omitted nullable columns
/// filled in as nulls so callers get a stable shape back.
fn normalize_row(table: &TableSchema, mut values: Row) -> Result<Row, StoreError> {
    for column in &table.columns {
        values.entry(column.name.clone()).or_insert(Value::Null);
    }
    Ok(values)
}

/// Best-effort decoding for the `sql` escape hatch, where no schema applies.
fn dynamic_row_to_json(row: &AnyRow) -> Row {
    let mut json = Map::new();
    for column in row.columns() {
        let name = column.name();
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(name) {
            v.map(|n| Value::Number(n.into()))
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(name) {
            v.and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))
        } else if let Ok(v) = row.try_get::<Option<String>, _>(name) {
            v.map(Value::String)
        } else {
            None
        };
        json.insert(name.to_string(), value.unwrap_or(Value::Null));
    }
    json
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;
    use crate::store::schema::{Column, ColumnKind, TableSchema, UserSchema};
    use serde_json::json;

    fn schema() -> UserSchema {
        UserSchema::new(vec![
            TableSchema {
                name: "accounts".into(),
                columns: vec![
                    Column::new("address", ColumnKind::Text).primary_key(),
                    Column::new("balance", ColumnKind::Integer),
                    Column::new("label", ColumnKind::Text).nullable(),
                ],
                onchain: true,
            },
            TableSchema {
                name: "snapshots".into(),
                columns: vec![Column::new("id", ColumnKind::Integer).primary_key()],
                onchain: false,
            },
        ])
        .unwrap()
    }

    async fn store() -> IndexingStore {
        let database = test_database().await;
        IndexingStore::attach(&database, "t1ab", schema()).await.unwrap()
    }

    fn account(address: &str, balance: i64) -> Row {
        json!({ "address": address, "balance": balance })
            .as_object()
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn insert_then_find_returns_the_row() {
        let store = store().await;
        let written = store
            .insert("accounts", account("0xaa", 10), OnConflict::Error)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written["label"], Value::Null);

        let found = store.find("accounts", &json!("0xaa")).await.unwrap().unwrap();
        assert_eq!(found["balance"], json!(10));
        assert_eq!(found["address"], json!("0xaa"));

        assert!(store.find("accounts", &json!("0xbb")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conflict_policies() {
        let store = store().await;
        store
            .insert("accounts", account("0xaa", 10), OnConflict::Error)
            .await
            .unwrap();

        // Error policy surfaces the duplicate.
        let err = store
            .insert("accounts", account("0xaa", 11), OnConflict::Error)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueConstraint(_)));

        // DoNothing skips quietly.
        let skipped = store
            .insert("accounts", account("0xaa", 11), OnConflict::DoNothing)
            .await
            .unwrap();
        assert!(skipped.is_none());
        let found = store.find("accounts", &json!("0xaa")).await.unwrap().unwrap();
        assert_eq!(found["balance"], json!(10));

        // DoUpdate merges.
        let set = json!({ "balance": 99 }).as_object().unwrap().clone();
        let merged = store
            .insert("accounts", account("0xaa", 11), OnConflict::DoUpdate(set))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged["balance"], json!(99));
    }

    #[tokio::test]
    async fn update_requires_an_existing_row() {
        let store = store().await;
        let set = json!({ "balance": 5 }).as_object().unwrap().clone();
        let err = store
            .update("accounts", &json!("0xaa"), set.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound { .. }));

        store
            .insert("accounts", account("0xaa", 1), OnConflict::Error)
            .await
            .unwrap();
        let updated = store.update("accounts", &json!("0xaa"), set).await.unwrap();
        assert_eq!(updated["balance"], json!(5));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = store().await;
        assert!(!store.delete("accounts", &json!("0xaa")).await.unwrap());
        store
            .insert("accounts", account("0xaa", 1), OnConflict::Error)
            .await
            .unwrap();
        assert!(store.delete("accounts", &json!("0xaa")).await.unwrap());
        assert!(store.find("accounts", &json!("0xaa")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offchain_tables_reject_writes_but_allow_reads() {
        let store = store().await;
        let row = json!({ "id": 1 }).as_object().unwrap().clone();
        let err = store
            .insert("snapshots", row, OnConflict::Error)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidStoreMethod(_)));
        assert!(store.find("snapshots", &json!(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undefined_tables_are_typed_errors() {
        let store = store().await;
        let err = store.find("nope", &json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::UndefinedTable(_)));
    }

    #[tokio::test]
    async fn sql_escape_hatch_is_read_only() {
        let store = store().await;
        store
            .insert("accounts", account("0xaa", 42), OnConflict::Error)
            .await
            .unwrap();

        let rows = store
            .sql("SELECT address, balance FROM \"t1ab__accounts\"")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["balance"], json!(42));

        for bad in [
            "DELETE FROM \"t1ab__accounts\"",
            "UPDATE \"t1ab__accounts\" SET balance = 0",
            "SELECT 1; DROP TABLE \"t1ab__accounts\"",
        ] {
            let err = store.sql(bad).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidStoreMethod(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn journal_rows_shadow_every_write() {
        let store = store().await;
        store.set_checkpoint(Checkpoint::block_start(1000, 1, 100));
        store
            .insert("accounts", account("0xaa", 1), OnConflict::Error)
            .await
            .unwrap();
        let set = json!({ "balance": 2 }).as_object().unwrap().clone();
        store.update("accounts", &json!("0xaa"), set).await.unwrap();
        store.delete("accounts", &json!("0xaa")).await.unwrap();

        let entries: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT operation, before_image FROM \"t1ab_reorg__accounts\" ORDER BY seq",
        )
        .fetch_all(&store.pool)
        .await
        .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].0, "insert");
        assert!(entries[0].1.is_none());
        assert_eq!(entries[1].0, "update");
        assert!(entries[1].1.as_deref().unwrap().contains("\"balance\":1"));
        assert_eq!(entries[2].0, "delete");
        assert!(entries[2].1.as_deref().unwrap().contains("\"balance\":2"));
    }
}
