//! JSON-RPC wire shapes and their conversions into stored chain data.
//!
//! EVM nodes encode quantities as 0x-prefixed hex strings; the `quantity`
//! serde helpers translate those into plain `u64`s at the boundary so the
//! rest of the engine never sees wire encoding.

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::Deserialize;

use crate::chain_data::{Block, Log, Transaction, TransactionReceipt};

/// Serde adapters for 0x-hex quantities.
pub mod quantity {
    use serde::{Deserialize, Deserializer};

    pub fn parse(raw: &str) -> Option<u64> {
        let digits = raw.strip_prefix("0x")?;
        if digits.is_empty() {
            return None;
        }
        u64::from_str_radix(digits, 16).ok()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("bad quantity: {raw}")))
    }

    pub mod opt {
        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u64>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            match raw {
                None => Ok(None),
                Some(raw) => super::parse(&raw)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("bad quantity: {raw}"))),
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    #[serde(with = "quantity")]
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    #[serde(with = "quantity")]
    pub timestamp: u64,
    #[serde(default)]
    pub miner: Option<Address>,
    #[serde(with = "quantity")]
    pub gas_used: u64,
    #[serde(with = "quantity")]
    pub gas_limit: u64,
    #[serde(default, with = "quantity::opt")]
    pub base_fee_per_gas: Option<u64>,
    #[serde(default)]
    pub extra_data: Option<Bytes>,
    /// Present as full objects only when the block was requested hydrated.
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

impl RpcBlock {
    pub fn into_block(self) -> Block {
        Block {
            number: self.number,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp,
            miner: self.miner.unwrap_or(Address::ZERO),
            gas_used: self.gas_used,
            gas_limit: self.gas_limit,
            base_fee_per_gas: self.base_fee_per_gas,
            extra_data: self.extra_data.unwrap_or_default(),
        }
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.transactions
            .iter()
            .map(|tx| tx.to_transaction(self.number, self.hash))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    #[serde(with = "quantity")]
    pub transaction_index: u64,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    #[serde(with = "quantity")]
    pub nonce: u64,
    #[serde(with = "quantity")]
    pub gas: u64,
    #[serde(default)]
    pub gas_price: Option<U256>,
}

impl RpcTransaction {
    pub fn to_transaction(&self, block_number: u64, block_hash: B256) -> Transaction {
        Transaction {
            hash: self.hash,
            block_number,
            block_hash,
            transaction_index: self.transaction_index,
            from: self.from,
            to: self.to,
            value: self.value,
            input: self.input.clone(),
            nonce: self.nonce,
            gas: self.gas,
            gas_price: self.gas_price,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(with = "quantity")]
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    #[serde(with = "quantity")]
    pub transaction_index: u64,
    #[serde(with = "quantity")]
    pub log_index: u64,
    #[serde(default)]
    pub removed: bool,
}

impl RpcLog {
    /// `eth_getLogs` does not carry the block timestamp; it is joined in
    /// from the enclosing block.
    pub fn to_log(&self, block_timestamp: u64) -> Log {
        Log {
            address: self.address,
            topics: self.topics.clone(),
            data: self.data.clone(),
            block_number: self.block_number,
            block_hash: self.block_hash,
            block_timestamp,
            transaction_hash: self.transaction_hash,
            transaction_index: self.transaction_index,
            log_index: self.log_index,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    #[serde(with = "quantity")]
    pub transaction_index: u64,
    #[serde(with = "quantity")]
    pub block_number: u64,
    pub block_hash: B256,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(with = "quantity")]
    pub cumulative_gas_used: u64,
    #[serde(with = "quantity")]
    pub gas_used: u64,
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(with = "quantity")]
    pub status: u64,
}

impl RpcReceipt {
    pub fn into_receipt(self) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: self.transaction_hash,
            transaction_index: self.transaction_index,
            block_number: self.block_number,
            block_hash: self.block_hash,
            from: self.from,
            to: self.to,
            cumulative_gas_used: self.cumulative_gas_used,
            gas_used: self.gas_used,
            contract_address: self.contract_address,
            status: self.status as u8,
        }
    }
}
