//! Shared-schema DDL: the `sync_*` cache tables and `_ponder_meta`.
//!
//! The `sync_` prefix stands in for a dedicated schema so the embedded
//! database kind (no schema support) works identically. All statements are
//! idempotent; every instance runs them at startup and concurrent instances
//! converge.

use sqlx::AnyPool;
use tracing::info;

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sync_blocks (
        chain_id BIGINT NOT NULL,
        hash TEXT NOT NULL,
        number BIGINT NOT NULL,
        parent_hash TEXT NOT NULL,
        timestamp BIGINT NOT NULL,
        miner TEXT NOT NULL,
        gas_used BIGINT NOT NULL,
        gas_limit BIGINT NOT NULL,
        base_fee_per_gas BIGINT,
        extra_data TEXT NOT NULL,
        PRIMARY KEY (chain_id, hash)
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_blocks_number
        ON sync_blocks(chain_id, number)",
    "CREATE TABLE IF NOT EXISTS sync_transactions (
        chain_id BIGINT NOT NULL,
        hash TEXT NOT NULL,
        block_number BIGINT NOT NULL,
        block_hash TEXT NOT NULL,
        transaction_index BIGINT NOT NULL,
        from_address TEXT NOT NULL,
        to_address TEXT,
        value TEXT NOT NULL,
        input TEXT NOT NULL,
        nonce BIGINT NOT NULL,
        gas BIGINT NOT NULL,
        gas_price TEXT,
        PRIMARY KEY (chain_id, hash)
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_transactions_block
        ON sync_transactions(chain_id, block_number)",
    "CREATE TABLE IF NOT EXISTS sync_transaction_receipts (
        chain_id BIGINT NOT NULL,
        transaction_hash TEXT NOT NULL,
        transaction_index BIGINT NOT NULL,
        block_number BIGINT NOT NULL,
        block_hash TEXT NOT NULL,
        from_address TEXT NOT NULL,
        to_address TEXT,
        cumulative_gas_used BIGINT NOT NULL,
        gas_used BIGINT NOT NULL,
        contract_address TEXT,
        status BIGINT NOT NULL,
        PRIMARY KEY (chain_id, transaction_hash)
    )",
    "CREATE TABLE IF NOT EXISTS sync_logs (
        chain_id BIGINT NOT NULL,
        block_hash TEXT NOT NULL,
        log_index BIGINT NOT NULL,
        address TEXT NOT NULL,
        topic0 TEXT,
        topic1 TEXT,
        topic2 TEXT,
        topic3 TEXT,
        data TEXT NOT NULL,
        block_number BIGINT NOT NULL,
        block_timestamp BIGINT NOT NULL,
        transaction_hash TEXT NOT NULL,
        transaction_index BIGINT NOT NULL,
        PRIMARY KEY (chain_id, block_hash, log_index)
    )",
    "CREATE INDEX IF NOT EXISTS idx_sync_logs_block
        ON sync_logs(chain_id, block_number)",
    "CREATE INDEX IF NOT EXISTS idx_sync_logs_address
        ON sync_logs(chain_id, address)",
    "CREATE TABLE IF NOT EXISTS sync_traces (
        chain_id BIGINT NOT NULL,
        trace_id TEXT NOT NULL,
        transaction_hash TEXT NOT NULL,
        block_number BIGINT NOT NULL,
        block_hash TEXT NOT NULL,
        transaction_index BIGINT NOT NULL,
        trace_address TEXT NOT NULL,
        call_type TEXT NOT NULL,
        from_address TEXT NOT NULL,
        to_address TEXT,
        value TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT NOT NULL,
        PRIMARY KEY (chain_id, trace_id)
    )",
    "CREATE TABLE IF NOT EXISTS sync_rpc_request_results (
        chain_id BIGINT NOT NULL,
        request_hash TEXT NOT NULL,
        result TEXT NOT NULL,
        block_number BIGINT,
        PRIMARY KEY (chain_id, request_hash)
    )",
    "CREATE TABLE IF NOT EXISTS sync_intervals (
        chain_id BIGINT NOT NULL,
        fingerprint TEXT NOT NULL,
        from_block BIGINT NOT NULL,
        to_block BIGINT NOT NULL,
        PRIMARY KEY (chain_id, fingerprint, from_block)
    )",
    "CREATE TABLE IF NOT EXISTS _ponder_meta (
        instance_id TEXT NOT NULL,
        build_id TEXT NOT NULL,
        schema_json TEXT NOT NULL,
        status TEXT NOT NULL,
        heartbeat_at BIGINT NOT NULL,
        checkpoint TEXT NOT NULL,
        PRIMARY KEY (instance_id)
    )",
];

pub async fn run_migrations(pool: &AnyPool) -> Result<(), sqlx::Error> {
    info!("running shared-schema migrations");
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("shared-schema migrations complete");
    Ok(())
}
