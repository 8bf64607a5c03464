//! Instance registry: `_ponder_meta`, crash recovery, live-view cutover,
//! stale-table GC.
//!
//! Every process run is an instance owning the `{instance_id}__*` namespace.
//! Instances with the same build id are interchangeable: a new process that
//! finds a dead sibling (stale heartbeat) adopts its instance id and resumes
//! from its committed checkpoint instead of re-indexing.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::AnyPool;
use thiserror::Error;
use tracing::{info, warn};

use crate::checkpoint::Checkpoint;
use crate::db::Database;
use crate::store::schema::UserSchema;

pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;
/// A heartbeat older than this marks the instance dead.
pub const STALE_AFTER_SECS: i64 = 60;
/// Non-live instances kept around for inspection after cutover.
const KEEP_STALE_INSTANCES: usize = 3;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("stored metadata is corrupt: {0}")]
    Corrupt(String),

    #[error("could not allocate an unused instance id")]
    InstanceIdExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Historical,
    Live,
    Stopped,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Historical => "historical",
            InstanceStatus::Live => "live",
            InstanceStatus::Stopped => "stopped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "historical" => Some(InstanceStatus::Historical),
            "live" => Some(InstanceStatus::Live),
            "stopped" => Some(InstanceStatus::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetaRow {
    pub instance_id: String,
    pub build_id: String,
    pub schema_json: String,
    pub status: InstanceStatus,
    pub heartbeat_at: i64,
    pub checkpoint: Checkpoint,
}

/// Deterministic identity of a build: configuration + schema + handler
/// source. Dev builds are namespaced so they never take part in crash
/// recovery and their leftovers are always collected.
pub fn compute_build_id(
    config_fingerprint: &str,
    schema_fingerprint: &str,
    handler_fingerprint: &str,
    dev: bool,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config_fingerprint.as_bytes());
    hasher.update(schema_fingerprint.as_bytes());
    hasher.update(handler_fingerprint.as_bytes());
    let digest = alloy_primitives::hex::encode(&hasher.finalize()[..8]);
    if dev {
        format!("dev:{digest}")
    } else {
        digest
    }
}

pub fn generate_instance_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Which dead sibling, if any, a starting instance should adopt.
pub fn adoption_candidate<'a>(
    rows: &'a [MetaRow],
    build_id: &str,
    now: i64,
    dev: bool,
) -> Option<&'a MetaRow> {
    if dev {
        return None;
    }
    rows.iter()
        .filter(|row| {
            row.build_id == build_id
                && row.status != InstanceStatus::Stopped
                && now - row.heartbeat_at > STALE_AFTER_SECS
        })
        .max_by_key(|row| row.heartbeat_at)
}

/// Instances whose tables should be dropped after cutover: everything not
/// live or mid-backfill beyond the three most recent, plus every dead dev
/// instance.
pub fn gc_victims(rows: &[MetaRow], active_instance_id: &str, now: i64) -> Vec<String> {
    let mut stale: Vec<&MetaRow> = rows
        .iter()
        .filter(|row| {
            row.instance_id != active_instance_id
                && !matches!(row.status, InstanceStatus::Live | InstanceStatus::Historical)
        })
        .collect();
    stale.sort_by_key(|row| std::cmp::Reverse(row.heartbeat_at));

    let mut victims: Vec<String> = stale
        .iter()
        .skip(KEEP_STALE_INSTANCES)
        .map(|row| row.instance_id.clone())
        .collect();

    for row in rows {
        if row.instance_id != active_instance_id
            && row.build_id.starts_with("dev:")
            && now - row.heartbeat_at > STALE_AFTER_SECS
            && !victims.contains(&row.instance_id)
        {
            victims.push(row.instance_id.clone());
        }
    }
    victims
}

pub struct InstanceRegistry {
    pool: AnyPool,
    instance_id: String,
    build_id: String,
    schema: UserSchema,
}

impl InstanceRegistry {
    /// Register this process in `_ponder_meta`. Returns the registry and,
    /// when a dead sibling was adopted, the checkpoint to resume from.
    pub async fn register(
        database: &Database,
        build_id: String,
        schema: UserSchema,
        dev: bool,
        now: i64,
    ) -> Result<(Self, Option<Checkpoint>), RegistryError> {
        let pool = database.pool().clone();
        let rows = load_meta(&pool).await?;
        let schema_json =
            serde_json::to_string(&schema.tables).map_err(|e| RegistryError::Corrupt(e.to_string()))?;

        if let Some(dead) = adoption_candidate(&rows, &build_id, now, dev) {
            info!(
                instance_id = %dead.instance_id,
                checkpoint = %dead.checkpoint,
                "adopting dead instance with matching build id"
            );
            let instance_id = dead.instance_id.clone();
            let resume_from = dead.checkpoint;
            sqlx::query(
                "UPDATE _ponder_meta SET status = $1, heartbeat_at = $2 WHERE instance_id = $3",
            )
            .bind(InstanceStatus::Historical.as_str())
            .bind(now)
            .bind(instance_id.clone())
            .execute(&pool)
            .await?;
            return Ok((
                InstanceRegistry {
                    pool,
                    instance_id,
                    build_id,
                    schema,
                },
                Some(resume_from),
            ));
        }

        // Fresh instance: allocate an unused 4-character id.
        let mut instance_id = None;
        for _ in 0..16 {
            let candidate = generate_instance_id();
            if !rows.iter().any(|row| row.instance_id == candidate) {
                instance_id = Some(candidate);
                break;
            }
        }
        let instance_id = instance_id.ok_or(RegistryError::InstanceIdExhausted)?;

        sqlx::query(
            "INSERT INTO _ponder_meta
             (instance_id, build_id, schema_json, status, heartbeat_at, checkpoint)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(instance_id.clone())
        .bind(build_id.clone())
        .bind(schema_json)
        .bind(InstanceStatus::Historical.as_str())
        .bind(now)
        .bind(Checkpoint::ZERO.encode())
        .execute(&pool)
        .await?;

        info!(instance_id = %instance_id, build_id = %build_id, "instance registered");
        Ok((
            InstanceRegistry {
                pool,
                instance_id,
                build_id,
                schema,
            },
            None,
        ))
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub async fn heartbeat(&self, now: i64) -> Result<(), RegistryError> {
        sqlx::query("UPDATE _ponder_meta SET heartbeat_at = $1 WHERE instance_id = $2")
            .bind(now)
            .bind(self.instance_id.clone())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the committed indexing checkpoint.
    pub async fn set_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), RegistryError> {
        sqlx::query("UPDATE _ponder_meta SET checkpoint = $1 WHERE instance_id = $2")
            .bind(checkpoint.encode())
            .bind(self.instance_id.clone())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_status(&self, status: InstanceStatus) -> Result<(), RegistryError> {
        sqlx::query("UPDATE _ponder_meta SET status = $1 WHERE instance_id = $2")
            .bind(status.as_str())
            .bind(self.instance_id.clone())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Point the public views at this instance's tables and go live. One
    /// transaction swaps every view, so readers never observe a mix; any
    /// previously live sibling is demoted.
    pub async fn cutover(&self) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await?;
        for table in &self.schema.tables {
            sqlx::query(&table.drop_view_sql()).execute(&mut *tx).await?;
            sqlx::query(&table.create_view_sql(&self.instance_id))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "UPDATE _ponder_meta SET status = $1 WHERE status = $2 AND instance_id != $3",
        )
        .bind(InstanceStatus::Stopped.as_str())
        .bind(InstanceStatus::Live.as_str())
        .bind(self.instance_id.clone())
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE _ponder_meta SET status = $1 WHERE instance_id = $2")
            .bind(InstanceStatus::Live.as_str())
            .bind(self.instance_id.clone())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(instance_id = %self.instance_id, "live view cutover complete");
        Ok(())
    }

    /// Drop tables of stale instances, keeping the three most recent.
    pub async fn stale_gc(&self, now: i64) -> Result<usize, RegistryError> {
        let rows = load_meta(&self.pool).await?;
        let victims = gc_victims(&rows, &self.instance_id, now);
        for victim in &victims {
            let Some(row) = rows.iter().find(|r| &r.instance_id == victim) else {
                continue;
            };
            let tables: Vec<crate::store::schema::TableSchema> =
                serde_json::from_str(&row.schema_json)
                    .map_err(|e| RegistryError::Corrupt(e.to_string()))?;
            for table in &tables {
                sqlx::query(&format!(
                    "DROP TABLE IF EXISTS \"{}\"",
                    table.physical_name(victim)
                ))
                .execute(&self.pool)
                .await?;
                sqlx::query(&format!(
                    "DROP TABLE IF EXISTS \"{}\"",
                    table.journal_name(victim)
                ))
                .execute(&self.pool)
                .await?;
            }
            sqlx::query("DELETE FROM _ponder_meta WHERE instance_id = $1")
                .bind(victim.clone())
                .execute(&self.pool)
                .await?;
            warn!(instance_id = %victim, "collected stale instance");
        }
        Ok(victims.len())
    }
}

pub async fn load_meta(pool: &AnyPool) -> Result<Vec<MetaRow>, RegistryError> {
    let rows: Vec<(String, String, String, String, i64, String)> = sqlx::query_as(
        "SELECT instance_id, build_id, schema_json, status, heartbeat_at, checkpoint
         FROM _ponder_meta",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|(instance_id, build_id, schema_json, status, heartbeat_at, checkpoint)| {
            Ok(MetaRow {
                instance_id,
                build_id,
                schema_json,
                status: InstanceStatus::parse(&status)
                    .ok_or_else(|| RegistryError::Corrupt(format!("status {status}")))?,
                heartbeat_at,
                checkpoint: Checkpoint::decode(&checkpoint)
                    .map_err(|e| RegistryError::Corrupt(e.to_string()))?,
            })
        })
        .collect()
}
