//! The reorg journal.
//!
//! Every user-table write leaves a shadow row in `{instance_id}_reorg__T`
//! recording how to undo it. On a reorg, rows above the common ancestor are
//! replayed in descending order and their inverses applied, restoring the
//! exact state the tables had at the ancestor checkpoint. Rows at or below
//! the finalized checkpoint can never be rolled back and are pruned.

use serde_json::Value;
use sqlx::{Any, AnyPool, Row as _};
use tracing::info;

use crate::checkpoint::Checkpoint;
use crate::store::schema::{TableSchema, UserSchema};
use crate::store::{Row, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    Insert,
    Update,
    Delete,
}

impl JournalOp {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalOp::Insert => "insert",
            JournalOp::Update => "update",
            JournalOp::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "insert" => Some(JournalOp::Insert),
            "update" => Some(JournalOp::Update),
            "delete" => Some(JournalOp::Delete),
            _ => None,
        }
    }
}

/// Write one journal row inside the transaction of the write it shadows.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn record(
    tx: &mut sqlx::Transaction<'_, Any>,
    table: &TableSchema,
    instance_id: &str,
    seq: i64,
    operation: JournalOp,
    checkpoint: Checkpoint,
    row_key: &str,
    before_image: Option<&Row>,
) -> Result<(), StoreError> {
    let before = before_image
        .map(|row| serde_json::to_string(row).expect("json rows always serialize"));
    sqlx::query(&format!(
        "INSERT INTO \"{}\" (seq, operation, checkpoint, row_key, before_image)
         VALUES ($1, $2, $3, $4, $5)",
        table.journal_name(instance_id)
    ))
    .bind(seq)
    .bind(operation.as_str())
    .bind(checkpoint.encode())
    .bind(row_key)
    .bind(before)
    .execute(&mut **tx)
    .await
    .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
    Ok(())
}

/// Decode a journal row key back into primary-key (column, value) pairs.
fn key_pairs_from_row_key(
    table: &TableSchema,
    row_key: &str,
) -> Result<Vec<(String, Value)>, StoreError> {
    let values: Vec<Value> =
        serde_json::from_str(row_key).map_err(|e| StoreError::InvalidKey {
            table: table.name.clone(),
            detail: e.to_string(),
        })?;
    let pk = table.primary_key_columns();
    if values.len() != pk.len() {
        return Err(StoreError::InvalidKey {
            table: table.name.clone(),
            detail: format!("journal key arity {} != {}", values.len(), pk.len()),
        });
    }
    Ok(pk
        .iter()
        .zip(values)
        .map(|(column, value)| (column.name.clone(), value))
        .collect())
}

/// Undo every write above `ancestor`, in descending checkpoint order, and
/// delete the replayed journal rows. One transaction covers all tables.
/// Returns the number of rows replayed.
pub async fn rollback(
    pool: &AnyPool,
    instance_id: &str,
    schema: &UserSchema,
    ancestor: Checkpoint,
) -> Result<u64, StoreError> {
    let encoded = ancestor.encode();
    let mut replayed = 0u64;
    let mut tx = pool.begin().await.map_err(StoreError::Db)?;

    for table in schema.onchain_tables() {
        let rows = sqlx::query(&format!(
            "SELECT operation, row_key, before_image FROM \"{}\"
             WHERE checkpoint > $1
             ORDER BY checkpoint DESC, seq DESC",
            table.journal_name(instance_id)
        ))
        .bind(encoded.clone())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx(&table.name, e))?;

        for row in &rows {
            let operation: String = row.try_get("operation").map_err(StoreError::Db)?;
            let row_key: String = row.try_get("row_key").map_err(StoreError::Db)?;
            let before_raw: Option<String> =
                row.try_get("before_image").map_err(StoreError::Db)?;
            let operation =
                JournalOp::parse(&operation).ok_or_else(|| StoreError::InvalidKey {
                    table: table.name.clone(),
                    detail: format!("unknown journal operation {operation}"),
                })?;
            let before: Option<Row> = before_raw
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .map_err(|e| StoreError::InvalidKey {
                    table: table.name.clone(),
                    detail: e.to_string(),
                })?;
            let pairs = key_pairs_from_row_key(table, &row_key)?;

            match (operation, before) {
                // The inverse of an insert is a delete by key.
                (JournalOp::Insert, _) => {
                    let sql = format!(
                        "DELETE FROM \"{}\" WHERE {}",
                        table.physical_name(instance_id),
                        super::where_key(&pairs, 1)
                    );
                    let mut query = sqlx::query(&sql);
                    for (column_name, value) in &pairs {
                        let column = table.column(column_name).expect("key column exists");
                        query = super::bind_value(query, table, column, value)?;
                    }
                    query
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
                }
                // The inverse of an update restores the before image.
                (JournalOp::Update, Some(before)) => {
                    super::update_row(&mut tx, table, instance_id, &pairs, &before).await?;
                }
                // The inverse of a delete re-inserts the before image.
                (JournalOp::Delete, Some(before)) => {
                    super::insert_row(&mut tx, table, instance_id, &before).await?;
                }
                (op, None) => {
                    return Err(StoreError::InvalidKey {
                        table: table.name.clone(),
                        detail: format!("journal {} row missing before image", op.as_str()),
                    });
                }
            }
        }

        sqlx::query(&format!(
            "DELETE FROM \"{}\" WHERE checkpoint > $1",
            table.journal_name(instance_id)
        ))
        .bind(encoded.clone())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx(&table.name, e))?;

        replayed += rows.len() as u64;
    }

    tx.commit().await.map_err(StoreError::Db)?;
    if replayed > 0 {
        info!(replayed, ancestor = %ancestor, "journal rollback complete");
    }
    Ok(replayed)
}

/// Drop journal rows at or below the finalized checkpoint.
pub async fn prune(
    pool: &AnyPool,
    instance_id: &str,
    schema: &UserSchema,
    finalized: Checkpoint,
) -> Result<u64, StoreError> {
    let encoded = finalized.encode();
    let mut pruned = 0u64;
    for table in schema.onchain_tables() {
        let result = sqlx::query(&format!(
            "DELETE FROM \"{}\" WHERE checkpoint <= $1",
            table.journal_name(instance_id)
        ))
        .bind(encoded.clone())
        .execute(pool)
        .await
        .map_err(|e| StoreError::from_sqlx(&table.name, e))?;
        pruned += result.rows_affected();
    }
    Ok(pruned)
}
