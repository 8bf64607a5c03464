//! On-chain data shapes held in the sync cache and attached to events.
//!
//! These are storage-oriented types: numbers are plain `u64`, binary fields
//! keep their EVM-native widths, and everything serializes to the hex forms
//! handlers expect.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    /// Unix seconds.
    pub timestamp: u64,
    pub miner: Address,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub base_fee_per_gas: Option<u64>,
    pub extra_data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_index: u64,
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub nonce: u64,
    pub gas: u64,
    pub gas_price: Option<U256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub block_number: u64,
    pub block_hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub cumulative_gas_used: u64,
    pub gas_used: u64,
    pub contract_address: Option<Address>,
    /// 1 = success, 0 = reverted.
    pub status: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: B256,
    pub block_timestamp: u64,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl Log {
    /// Natural cache key: unique within a chain.
    pub fn log_id(&self) -> String {
        format!("{}-{}", self.block_hash, self.log_index)
    }

    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_index: u64,
    /// Position in the call tree, e.g. "0.2.1".
    pub trace_address: String,
    pub call_type: String,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    pub output: Bytes,
}

impl Trace {
    pub fn trace_id(&self) -> String {
        format!("{}-{}", self.transaction_hash, self.trace_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_id_is_stable_per_block_position() {
        let log = Log {
            address: Address::ZERO,
            topics: vec![],
            data: Bytes::new(),
            block_number: 10,
            block_hash: B256::repeat_byte(0xab),
            block_timestamp: 1000,
            transaction_hash: B256::repeat_byte(0x01),
            transaction_index: 0,
            log_index: 3,
        };
        assert!(log.log_id().ends_with("-3"));
        assert!(log.log_id().starts_with("0xab"));
    }
}
