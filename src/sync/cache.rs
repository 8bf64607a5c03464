//! The durable, shared sync cache.
//!
//! Rows are keyed by natural blockchain identifiers and written with
//! `ON CONFLICT DO NOTHING`, so any number of instances may write
//! concurrently without row locking. Only finalized data is accepted: the
//! cache refuses rows above the finalized height its syncs have reported
//! for a chain.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use moka::future::Cache as MokaCache;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use thiserror::Error;

use crate::chain_data::{Block, Log, Trace, Transaction, TransactionReceipt};
use crate::db::codec::{
    decode_address, decode_b256, decode_bytes, decode_u256, encode_address, encode_b256,
    encode_bytes, encode_u256, CodecError,
};
use crate::db::Database;
use crate::sync::intervals::{self, IntervalSet};

const RPC_MEMO_CAPACITY: u64 = 10_000;

#[derive(Error, Debug)]
pub enum SyncCacheError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("chain {chain_id}: refusing unfinalized row at block {block} (finalized {finalized})")]
    AboveFinalized {
        chain_id: u64,
        block: u64,
        finalized: u64,
    },
}

/// One historical chunk, committed atomically together with its interval row.
#[derive(Debug, Default, Clone)]
pub struct ChunkData {
    pub blocks: Vec<Block>,
    pub transactions: Vec<Transaction>,
    pub receipts: Vec<TransactionReceipt>,
    pub logs: Vec<Log>,
    pub traces: Vec<Trace>,
}

#[derive(Clone)]
pub struct SyncCache {
    database: Database,
    /// Finalized height per chain, maintained by the sync tasks.
    finalized: Arc<RwLock<HashMap<u64, u64>>>,
    /// Memoized deterministic RPC results, in front of the durable table.
    rpc_memo: MokaCache<(u64, String), String>,
}

impl SyncCache {
    pub fn new(database: Database) -> Self {
        SyncCache {
            database,
            finalized: Arc::new(RwLock::new(HashMap::new())),
            rpc_memo: MokaCache::builder().max_capacity(RPC_MEMO_CAPACITY).build(),
        }
    }

    pub fn pool(&self) -> &AnyPool {
        self.database.pool()
    }

    pub fn set_finalized(&self, chain_id: u64, height: u64) {
        self.finalized
            .write()
            .expect("finalized map lock")
            .insert(chain_id, height);
    }

    pub fn finalized(&self, chain_id: u64) -> Option<u64> {
        self.finalized
            .read()
            .expect("finalized map lock")
            .get(&chain_id)
            .copied()
    }

    fn check_finalized(&self, chain_id: u64, data: &ChunkData) -> Result<(), SyncCacheError> {
        let Some(finalized) = self.finalized(chain_id) else {
            return Ok(());
        };
        let highest = data
            .blocks
            .iter()
            .map(|b| b.number)
            .chain(data.logs.iter().map(|l| l.block_number))
            .chain(data.transactions.iter().map(|t| t.block_number))
            .max();
        if let Some(block) = highest {
            if block > finalized {
                return Err(SyncCacheError::AboveFinalized {
                    chain_id,
                    block,
                    finalized,
                });
            }
        }
        Ok(())
    }

    /// Write a chunk and, when `interval` is given, its bookkeeping row in
    /// one transaction. Partial failure leaves `sync_intervals` untouched so
    /// the chunk is replanned.
    pub async fn insert_chunk(
        &self,
        chain_id: u64,
        data: &ChunkData,
        interval: Option<(&str, u64, u64)>,
    ) -> Result<(), SyncCacheError> {
        self.check_finalized(chain_id, data)?;
        let mut tx = self.pool().begin().await?;

        for block in &data.blocks {
            sqlx::query(
                "INSERT INTO sync_blocks
                 (chain_id, hash, number, parent_hash, timestamp, miner,
                  gas_used, gas_limit, base_fee_per_gas, extra_data)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (chain_id, hash) DO NOTHING",
            )
            .bind(chain_id as i64)
            .bind(encode_b256(&block.hash))
            .bind(block.number as i64)
            .bind(encode_b256(&block.parent_hash))
            .bind(block.timestamp as i64)
            .bind(encode_address(&block.miner))
            .bind(block.gas_used as i64)
            .bind(block.gas_limit as i64)
            .bind(block.base_fee_per_gas.map(|f| f as i64))
            .bind(encode_bytes(&block.extra_data))
            .execute(&mut *tx)
            .await?;
        }

        for transaction in &data.transactions {
            sqlx::query(
                "INSERT INTO sync_transactions
                 (chain_id, hash, block_number, block_hash, transaction_index,
                  from_address, to_address, value, input, nonce, gas, gas_price)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                 ON CONFLICT (chain_id, hash) DO NOTHING",
            )
            .bind(chain_id as i64)
            .bind(encode_b256(&transaction.hash))
            .bind(transaction.block_number as i64)
            .bind(encode_b256(&transaction.block_hash))
            .bind(transaction.transaction_index as i64)
            .bind(encode_address(&transaction.from))
            .bind(transaction.to.as_ref().map(encode_address))
            .bind(encode_u256(&transaction.value))
            .bind(encode_bytes(&transaction.input))
            .bind(transaction.nonce as i64)
            .bind(transaction.gas as i64)
            .bind(transaction.gas_price.as_ref().map(encode_u256))
            .execute(&mut *tx)
            .await?;
        }

        for receipt in &data.receipts {
            sqlx::query(
                "INSERT INTO sync_transaction_receipts
                 (chain_id, transaction_hash, transaction_index, block_number,
                  block_hash, from_address, to_address, cumulative_gas_used,
                  gas_used, contract_address, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (chain_id, transaction_hash) DO NOTHING",
            )
            .bind(chain_id as i64)
            .bind(encode_b256(&receipt.transaction_hash))
            .bind(receipt.transaction_index as i64)
            .bind(receipt.block_number as i64)
            .bind(encode_b256(&receipt.block_hash))
            .bind(encode_address(&receipt.from))
            .bind(receipt.to.as_ref().map(encode_address))
            .bind(receipt.cumulative_gas_used as i64)
            .bind(receipt.gas_used as i64)
            .bind(receipt.contract_address.as_ref().map(encode_address))
            .bind(receipt.status as i64)
            .execute(&mut *tx)
            .await?;
        }

        for log in &data.logs {
            sqlx::query(
                "INSERT INTO sync_logs
                 (chain_id, block_hash, log_index, address, topic0, topic1,
                  topic2, topic3, data, block_number, block_timestamp,
                  transaction_hash, transaction_index)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 ON CONFLICT (chain_id, block_hash, log_index) DO NOTHING",
            )
            .bind(chain_id as i64)
            .bind(encode_b256(&log.block_hash))
            .bind(log.log_index as i64)
            .bind(encode_address(&log.address))
            .bind(log.topics.first().map(encode_b256))
            .bind(log.topics.get(1).map(encode_b256))
            .bind(log.topics.get(2).map(encode_b256))
            .bind(log.topics.get(3).map(encode_b256))
            .bind(encode_bytes(&log.data))
            .bind(log.block_number as i64)
            .bind(log.block_timestamp as i64)
            .bind(encode_b256(&log.transaction_hash))
            .bind(log.transaction_index as i64)
            .execute(&mut *tx)
            .await?;
        }

        for trace in &data.traces {
            sqlx::query(
                "INSERT INTO sync_traces
                 (chain_id, trace_id, transaction_hash, block_number, block_hash,
                  transaction_index, trace_address, call_type, from_address,
                  to_address, value, input, output)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 ON CONFLICT (chain_id, trace_id) DO NOTHING",
            )
            .bind(chain_id as i64)
            .bind(trace.trace_id())
            .bind(encode_b256(&trace.transaction_hash))
            .bind(trace.block_number as i64)
            .bind(encode_b256(&trace.block_hash))
            .bind(trace.transaction_index as i64)
            .bind(trace.trace_address.clone())
            .bind(trace.call_type.clone())
            .bind(encode_address(&trace.from))
            .bind(trace.to.as_ref().map(encode_address))
            .bind(encode_u256(&trace.value))
            .bind(encode_bytes(&trace.input))
            .bind(encode_bytes(&trace.output))
            .execute(&mut *tx)
            .await?;
        }

        if let Some((fingerprint, from_block, to_block)) = interval {
            intervals::insert_interval(&mut *tx, chain_id, fingerprint, from_block, to_block)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_blocks(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Block>, SyncCacheError> {
        let rows = sqlx::query(
            "SELECT hash, number, parent_hash, timestamp, miner, gas_used,
                    gas_limit, base_fee_per_gas, extra_data
             FROM sync_blocks
             WHERE chain_id = $1 AND number >= $2 AND number <= $3
             ORDER BY number",
        )
        .bind(chain_id as i64)
        .bind(from_block as i64)
        .bind(to_block as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(block_from_row).collect()
    }

    pub async fn get_logs(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, SyncCacheError> {
        let rows = sqlx::query(
            "SELECT block_hash, log_index, address, topic0, topic1, topic2,
                    topic3, data, block_number, block_timestamp,
                    transaction_hash, transaction_index
             FROM sync_logs
             WHERE chain_id = $1 AND block_number >= $2 AND block_number <= $3
             ORDER BY block_number, log_index",
        )
        .bind(chain_id as i64)
        .bind(from_block as i64)
        .bind(to_block as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    pub async fn get_transactions(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Transaction>, SyncCacheError> {
        let rows = sqlx::query(
            "SELECT hash, block_number, block_hash, transaction_index,
                    from_address, to_address, value, input, nonce, gas, gas_price
             FROM sync_transactions
             WHERE chain_id = $1 AND block_number >= $2 AND block_number <= $3
             ORDER BY block_number, transaction_index",
        )
        .bind(chain_id as i64)
        .bind(from_block as i64)
        .bind(to_block as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    pub async fn get_receipts(
        &self,
        chain_id: u64,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransactionReceipt>, SyncCacheError> {
        let rows = sqlx::query(
            "SELECT transaction_hash, transaction_index, block_number, block_hash,
                    from_address, to_address, cumulative_gas_used, gas_used,
                    contract_address, status
             FROM sync_transaction_receipts
             WHERE chain_id = $1 AND block_number >= $2 AND block_number <= $3
             ORDER BY block_number, transaction_index",
        )
        .bind(chain_id as i64)
        .bind(from_block as i64)
        .bind(to_block as i64)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(receipt_from_row).collect()
    }

    pub async fn get_intervals(
        &self,
        chain_id: u64,
        fingerprint: &str,
    ) -> Result<IntervalSet, SyncCacheError> {
        Ok(intervals::get_intervals(self.pool(), chain_id, fingerprint).await?)
    }

    pub async fn compact_intervals(
        &self,
        chain_id: u64,
        fingerprint: &str,
    ) -> Result<(), SyncCacheError> {
        Ok(intervals::compact(self.pool(), chain_id, fingerprint).await?)
    }

    /// Look up a memoized deterministic RPC result, falling back to the
    /// durable table. Returns whether the value was served from memory.
    pub async fn get_rpc_result(
        &self,
        chain_id: u64,
        request_hash: &str,
    ) -> Result<Option<(String, bool)>, SyncCacheError> {
        let key = (chain_id, request_hash.to_string());
        if let Some(hit) = self.rpc_memo.get(&key).await {
            return Ok(Some((hit, true)));
        }
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT result FROM sync_rpc_request_results
             WHERE chain_id = $1 AND request_hash = $2",
        )
        .bind(chain_id as i64)
        .bind(request_hash)
        .fetch_optional(self.pool())
        .await?;
        if let Some((result,)) = row {
            self.rpc_memo.insert(key, result.clone()).await;
            return Ok(Some((result, false)));
        }
        Ok(None)
    }

    pub async fn insert_rpc_result(
        &self,
        chain_id: u64,
        request_hash: &str,
        result: &str,
        block_number: Option<u64>,
    ) -> Result<(), SyncCacheError> {
        sqlx::query(
            "INSERT INTO sync_rpc_request_results (chain_id, request_hash, result, block_number)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (chain_id, request_hash) DO NOTHING",
        )
        .bind(chain_id as i64)
        .bind(request_hash)
        .bind(result)
        .bind(block_number.map(|n| n as i64))
        .execute(self.pool())
        .await?;
        self.rpc_memo
            .insert((chain_id, request_hash.to_string()), result.to_string())
            .await;
        Ok(())
    }
}

fn block_from_row(row: &AnyRow) -> Result<Block, SyncCacheError> {
    Ok(Block {
        hash: decode_b256(&row.try_get::<String, _>("hash")?)?,
        number: row.try_get::<i64, _>("number")? as u64,
        parent_hash: decode_b256(&row.try_get::<String, _>("parent_hash")?)?,
        timestamp: row.try_get::<i64, _>("timestamp")? as u64,
        miner: decode_address(&row.try_get::<String, _>("miner")?)?,
        gas_used: row.try_get::<i64, _>("gas_used")? as u64,
        gas_limit: row.try_get::<i64, _>("gas_limit")? as u64,
        base_fee_per_gas: row
            .try_get::<Option<i64>, _>("base_fee_per_gas")?
            .map(|f| f as u64),
        extra_data: decode_bytes(&row.try_get::<String, _>("extra_data")?)?,
    })
}

fn log_from_row(row: &AnyRow) -> Result<Log, SyncCacheError> {
    let mut topics = Vec::with_capacity(4);
    for column in ["topic0", "topic1", "topic2", "topic3"] {
        match row.try_get::<Option<String>, _>(column)? {
            Some(raw) => topics.push(decode_b256(&raw)?),
            None => break,
        }
    }
    Ok(Log {
        address: decode_address(&row.try_get::<String, _>("address")?)?,
        topics,
        data: decode_bytes(&row.try_get::<String, _>("data")?)?,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_hash: decode_b256(&row.try_get::<String, _>("block_hash")?)?,
        block_timestamp: row.try_get::<i64, _>("block_timestamp")? as u64,
        transaction_hash: decode_b256(&row.try_get::<String, _>("transaction_hash")?)?,
        transaction_index: row.try_get::<i64, _>("transaction_index")? as u64,
        log_index: row.try_get::<i64, _>("log_index")? as u64,
    })
}

fn transaction_from_row(row: &AnyRow) -> Result<Transaction, SyncCacheError> {
    Ok(Transaction {
        hash: decode_b256(&row.try_get::<String, _>("hash")?)?,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_hash: decode_b256(&row.try_get::<String, _>("block_hash")?)?,
        transaction_index: row.try_get::<i64, _>("transaction_index")? as u64,
        from: decode_address(&row.try_get::<String, _>("from_address")?)?,
        to: row
            .try_get::<Option<String>, _>("to_address")?
            .map(|raw| decode_address(&raw))
            .transpose()?,
        value: decode_u256(&row.try_get::<String, _>("value")?)?,
        input: decode_bytes(&row.try_get::<String, _>("input")?)?,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        gas: row.try_get::<i64, _>("gas")? as u64,
        gas_price: row
            .try_get::<Option<String>, _>("gas_price")?
            .map(|raw| decode_u256(&raw))
            .transpose()?,
    })
}

fn receipt_from_row(row: &AnyRow) -> Result<TransactionReceipt, SyncCacheError> {
    Ok(TransactionReceipt {
        transaction_hash: decode_b256(&row.try_get::<String, _>("transaction_hash")?)?,
        transaction_index: row.try_get::<i64, _>("transaction_index")? as u64,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_hash: decode_b256(&row.try_get::<String, _>("block_hash")?)?,
        from: decode_address(&row.try_get::<String, _>("from_address")?)?,
        to: row
            .try_get::<Option<String>, _>("to_address")?
            .map(|raw| decode_address(&raw))
            .transpose()?,
        cumulative_gas_used: row.try_get::<i64, _>("cumulative_gas_used")? as u64,
        gas_used: row.try_get::<i64, _>("gas_used")? as u64,
        contract_address: row
            .try_get::<Option<String>, _>("contract_address")?
            .map(|raw| decode_address(&raw))
            .transpose()?,
        status: row.try_get::<i64, _>("status")? as u8,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;
    use alloy_primitives::{Address, Bytes, B256, U256};

    fn block(number: u64, timestamp: u64) -> Block {
        Block {
            number,
            hash: B256::repeat_byte(number as u8),
            parent_hash: B256::repeat_byte(number.wrapping_sub(1) as u8),
            timestamp,
            miner: Address::repeat_byte(0x99),
            gas_used: 21_000,
            gas_limit: 30_000_000,
            base_fee_per_gas: Some(7),
            extra_data: Bytes::from(vec![1, 2, 3]),
        }
    }

    fn log(blk: &Block, log_index: u64) -> Log {
        Log {
            address: Address::repeat_byte(0xaa),
            topics: vec![B256::repeat_byte(0x10), B256::repeat_byte(0x11)],
            data: Bytes::from(vec![0xde, 0xad]),
            block_number: blk.number,
            block_hash: blk.hash,
            block_timestamp: blk.timestamp,
            transaction_hash: B256::repeat_byte(0x42),
            transaction_index: 0,
            log_index,
        }
    }

    async fn cache() -> SyncCache {
        SyncCache::new(test_database().await)
    }

    #[tokio::test]
    async fn chunk_round_trip() {
        let cache = cache().await;
        let blk = block(100, 1000);
        let data = ChunkData {
            blocks: vec![blk.clone()],
            logs: vec![log(&blk, 0), log(&blk, 1)],
            transactions: vec![Transaction {
                hash: B256::repeat_byte(0x42),
                block_number: 100,
                block_hash: blk.hash,
                transaction_index: 0,
                from: Address::repeat_byte(1),
                to: None,
                value: U256::from(5u64),
                input: Bytes::new(),
                nonce: 9,
                gas: 21_000,
                gas_price: Some(U256::from(100u64)),
            }],
            ..Default::default()
        };
        cache
            .insert_chunk(1, &data, Some(("fp", 100, 100)))
            .await
            .unwrap();

        let blocks = cache.get_blocks(1, 50, 150).await.unwrap();
        assert_eq!(blocks, vec![blk]);

        let logs = cache.get_logs(1, 100, 100).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].topics.len(), 2);

        let transactions = cache.get_transactions(1, 100, 100).await.unwrap();
        assert_eq!(transactions[0].to, None);
        assert_eq!(transactions[0].value, U256::from(5u64));

        let intervals = cache.get_intervals(1, "fp").await.unwrap();
        assert!(intervals.covers(100, 100));

        // Another chain sees nothing.
        assert!(cache.get_blocks(2, 0, 1000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_writes_converge() {
        let cache = cache().await;
        let blk = block(10, 500);
        let data = ChunkData {
            blocks: vec![blk.clone()],
            ..Default::default()
        };
        cache.insert_chunk(1, &data, None).await.unwrap();
        cache.insert_chunk(1, &data, None).await.unwrap();
        assert_eq!(cache.get_blocks(1, 10, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refuses_rows_above_finalized() {
        let cache = cache().await;
        cache.set_finalized(1, 99);
        let data = ChunkData {
            blocks: vec![block(100, 1000)],
            ..Default::default()
        };
        let error = cache.insert_chunk(1, &data, None).await.unwrap_err();
        assert!(matches!(
            error,
            SyncCacheError::AboveFinalized {
                block: 100,
                finalized: 99,
                ..
            }
        ));
        // At the boundary is fine.
        cache.set_finalized(1, 100);
        cache.insert_chunk(1, &data, None).await.unwrap();
    }

    #[tokio::test]
    async fn rpc_memo_layers_over_the_table() {
        let cache = cache().await;
        assert!(cache.get_rpc_result(1, "req").await.unwrap().is_none());
        cache
            .insert_rpc_result(1, "req", "0x01", Some(5))
            .await
            .unwrap();
        let (value, from_memory) = cache.get_rpc_result(1, "req").await.unwrap().unwrap();
        assert_eq!(value, "0x01");
        assert!(from_memory);

        // A fresh cache over the same database hits the table first.
        let cold = SyncCache::new(cache.database.clone());
        let (value, from_memory) = cold.get_rpc_result(1, "req").await.unwrap().unwrap();
        assert_eq!(value, "0x01");
        assert!(!from_memory);
    }
}
