//! Database connection and shared-schema migrations.
//!
//! Both recognized database kinds (postgres, embedded sqlite) ride the sqlx
//! `Any` driver over a single dialect-neutral SQL subset: `$n` placeholders,
//! `ON CONFLICT`, `CREATE ... IF NOT EXISTS`, plain TEXT/BIGINT columns.

pub mod codec;
pub mod migration;

use std::sync::Once;

use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tracing::info;

use crate::config::{DatabaseConfig, DatabaseKind};

static INSTALL_DRIVERS: Once = Once::new();

#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    kind: DatabaseKind,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let url = config.resolve_connection_string();
        // Every connection to an in-memory sqlite database is a separate
        // database; a pool wider than one would shear the schema apart.
        let max_connections = if url.contains(":memory:") || url.contains("mode=memory") {
            1
        } else {
            10
        };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;

        if matches!(config.kind, DatabaseKind::Sqlite) && !url.contains(":memory:") {
            sqlx::query("PRAGMA journal_mode=WAL")
                .execute(&pool)
                .await
                .ok();
        }
        info!(kind = ?config.kind, "database connection established");

        Ok(Database {
            pool,
            kind: config.kind,
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        migration::run_migrations(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
pub(crate) async fn test_database() -> Database {
    let config = DatabaseConfig {
        kind: DatabaseKind::Sqlite,
        connection_string: Some("sqlite::memory:".to_string()),
        schema: "public".to_string(),
    };
    let database = Database::connect(&config).await.expect("in-memory database");
    database.migrate().await.expect("migrations");
    database
}
