//! Contract subscriptions.
//!
//! A source describes one contract on one chain: which addresses to watch,
//! which events to decode, and the block range to cover. The filter
//! fingerprint identifies a subscription in the sync cache's interval
//! bookkeeping independently of block range.

use alloy_primitives::{keccak256, Address, B256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::checkpoint::Checkpoint;
use crate::chain_data::Log;

/// How a source resolves the addresses it watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressCriteria {
    /// A fixed contract address.
    Single(Address),
    /// Child contracts discovered by watching a creation log on a parent.
    Factory(FactoryCriteria),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryCriteria {
    /// The parent contract emitting the creation event.
    pub address: Address,
    /// topic0 of the creation event.
    pub event_topic0: B256,
    /// Where the child address lives in the creation log.
    pub parameter: FactoryParameter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactoryParameter {
    Topic1,
    Topic2,
    Topic3,
    /// 32-byte word offset into the log data.
    DataWord(usize),
}

impl FactoryCriteria {
    /// Extract the child address if `log` is a creation event of this factory.
    pub fn child_address(&self, log: &Log) -> Option<Address> {
        if log.address != self.address || log.topic0() != Some(self.event_topic0) {
            return None;
        }
        let word: B256 = match self.parameter {
            FactoryParameter::Topic1 => *log.topics.get(1)?,
            FactoryParameter::Topic2 => *log.topics.get(2)?,
            FactoryParameter::Topic3 => *log.topics.get(3)?,
            FactoryParameter::DataWord(index) => {
                let start = index * 32;
                let bytes = log.data.get(start..start + 32)?;
                B256::from_slice(bytes)
            }
        };
        Some(Address::from_slice(&word[12..]))
    }
}

/// One subscribed event: name plus its topic0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiEvent {
    pub name: String,
    pub signature: String,
    pub topic0: B256,
}

impl AbiEvent {
    /// Parse a canonical signature like `Transfer(address,address,uint256)`.
    pub fn parse(signature: &str) -> Option<Self> {
        let canonical: String = signature.chars().filter(|c| !c.is_whitespace()).collect();
        let paren = canonical.find('(')?;
        if !canonical.ends_with(')') || paren == 0 {
            return None;
        }
        Some(AbiEvent {
            name: canonical[..paren].to_string(),
            topic0: keccak256(canonical.as_bytes()),
            signature: canonical,
        })
    }
}

/// Server-side narrowing of a source's logs beyond topic0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    /// Restrict to a single event name from the source's ABI.
    pub event: Option<String>,
    /// Positional match on topics 1..=3; `None` matches anything.
    pub args: Vec<Option<B256>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Contract name from the configuration; the handler registry key.
    pub name: String,
    pub network: String,
    pub chain_id: u64,
    pub address: AddressCriteria,
    pub events: Vec<AbiEvent>,
    pub filter: LogFilter,
    pub start_block: u64,
    pub end_block: Option<u64>,
    pub include_transaction_receipts: bool,
}

impl Source {
    /// Checkpoint of the synthetic setup event for this source.
    pub fn setup_checkpoint(&self, start_block_timestamp: u64) -> Checkpoint {
        Checkpoint::block_start(start_block_timestamp, self.chain_id, self.start_block)
    }

    /// The subscribed topic0 values, after applying `filter.event`.
    pub fn topic0_set(&self) -> Vec<B256> {
        self.events
            .iter()
            .filter(|e| match &self.filter.event {
                Some(name) => &e.name == name,
                None => true,
            })
            .map(|e| e.topic0)
            .collect()
    }

    /// Event name for a matched log, by topic0.
    pub fn event_name(&self, topic0: B256) -> Option<&str> {
        self.events
            .iter()
            .find(|e| e.topic0 == topic0)
            .map(|e| e.name.as_str())
    }

    /// Whether `log` belongs to this source, given the currently known
    /// factory children (ignored for single-address sources).
    pub fn matches(&self, log: &Log, factory_children: &[Address]) -> bool {
        let address_ok = match &self.address {
            AddressCriteria::Single(address) => log.address == *address,
            AddressCriteria::Factory(_) => factory_children.contains(&log.address),
        };
        if !address_ok {
            return false;
        }
        let Some(topic0) = log.topic0() else {
            return false;
        };
        if !self.topic0_set().contains(&topic0) {
            return false;
        }
        for (position, wanted) in self.filter.args.iter().enumerate() {
            if let Some(expected) = wanted {
                if log.topics.get(position + 1) != Some(expected) {
                    return false;
                }
            }
        }
        true
    }

    /// Deterministic identity of the effective log filter, independent of
    /// block range. Keys the sync cache's `sync_intervals` rows.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.chain_id.to_be_bytes());
        match &self.address {
            AddressCriteria::Single(address) => {
                hasher.update(b"single");
                hasher.update(address.as_slice());
            }
            AddressCriteria::Factory(factory) => {
                hasher.update(b"factory");
                hasher.update(factory.address.as_slice());
                hasher.update(factory.event_topic0.as_slice());
                hasher.update(format!("{:?}", factory.parameter).as_bytes());
            }
        }
        for topic0 in self.topic0_set() {
            hasher.update(topic0.as_slice());
        }
        for arg in &self.filter.args {
            match arg {
                Some(topic) => hasher.update(topic.as_slice()),
                None => hasher.update(b"*"),
            }
        }
        hasher.update([self.include_transaction_receipts as u8]);
        let digest = hasher.finalize();
        alloy_primitives::hex::encode(&digest[..8])
    }
}
