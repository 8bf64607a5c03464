//! The event stream delivered to user handlers.

use std::collections::HashMap;

use alloy_primitives::Address;
use serde::{Deserialize, Serialize};

use crate::chain_data::{Block, Log, Trace, Transaction, TransactionReceipt};
use crate::checkpoint::Checkpoint;
use crate::source::Source;

/// A fully materialized event. Log events carry their enclosing block,
/// transaction and (when the source asked for them) receipt, so handlers
/// never need an extra RPC round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Synthesized once per (contract, network) at the contract's start
    /// block, before any of its log events.
    Setup {
        checkpoint: Checkpoint,
        contract: String,
    },
    Log {
        checkpoint: Checkpoint,
        contract: String,
        event_name: String,
        log: Log,
        block: Block,
        transaction: Transaction,
        receipt: Option<TransactionReceipt>,
    },
    Block {
        checkpoint: Checkpoint,
        contract: String,
        block: Block,
    },
    Trace {
        checkpoint: Checkpoint,
        contract: String,
        trace: Trace,
        block: Block,
        transaction: Transaction,
    },
}

impl Event {
    pub fn checkpoint(&self) -> Checkpoint {
        match self {
            Event::Setup { checkpoint, .. }
            | Event::Log { checkpoint, .. }
            | Event::Block { checkpoint, .. }
            | Event::Trace { checkpoint, .. } => *checkpoint,
        }
    }

    pub fn contract(&self) -> &str {
        match self {
            Event::Setup { contract, .. }
            | Event::Log { contract, .. }
            | Event::Block { contract, .. }
            | Event::Trace { contract, .. } => contract,
        }
    }

    /// The handler registry key for this event within its contract.
    pub fn event_name(&self) -> &str {
        match self {
            Event::Setup { .. } => "setup",
            Event::Log { event_name, .. } => event_name,
            Event::Block { .. } => "block",
            Event::Trace { .. } => "trace",
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.checkpoint().chain_id
    }
}

/// Turn one block's worth of synced data into ordered events for the given
/// sources. `factory_children` maps a source name to its discovered child
/// addresses. Logs outside every source are dropped here.
pub fn build_events(
    chain_id: u64,
    block: &Block,
    logs: &[Log],
    transactions: &[Transaction],
    receipts: &[TransactionReceipt],
    sources: &[Source],
    factory_children: &HashMap<String, Vec<Address>>,
) -> Vec<Event> {
    let tx_by_hash: HashMap<_, _> = transactions.iter().map(|t| (t.hash, t)).collect();
    let receipt_by_hash: HashMap<_, _> = receipts.iter().map(|r| (r.transaction_hash, r)).collect();

    let mut events = Vec::new();
    for log in logs {
        for source in sources {
            if log.block_number < source.start_block {
                continue;
            }
            if let Some(end) = source.end_block {
                if log.block_number > end {
                    continue;
                }
            }
            let children = factory_children
                .get(&source.name)
                .map(Vec::as_slice)
                .unwrap_or_default();
            if !source.matches(log, children) {
                continue;
            }
            let Some(event_name) = log.topic0().and_then(|t| source.event_name(t)) else {
                continue;
            };
            let Some(transaction) = tx_by_hash.get(&log.transaction_hash) else {
                continue;
            };
            let receipt = if source.include_transaction_receipts {
                receipt_by_hash.get(&log.transaction_hash).map(|r| (*r).clone())
            } else {
                None
            };
            events.push(Event::Log {
                checkpoint: Checkpoint {
                    block_timestamp: block.timestamp,
                    chain_id,
                    block_number: log.block_number,
                    transaction_index: log.transaction_index,
                    event_index: log.log_index,
                },
                contract: source.name.clone(),
                event_name: event_name.to_string(),
                log: log.clone(),
                block: block.clone(),
                transaction: (*transaction).clone(),
                receipt,
            });
        }
    }
    events.sort_by_key(|e| e.checkpoint());
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{AbiEvent, AddressCriteria, LogFilter};
    use alloy_primitives::{Bytes, B256, U256};

    fn block(number: u64, timestamp: u64) -> Block {
        Block {
            number,
            hash: B256::repeat_byte(number as u8),
            parent_hash: B256::repeat_byte(number.wrapping_sub(1) as u8),
            timestamp,
            miner: Address::ZERO,
            gas_used: 0,
            gas_limit: 30_000_000,
            base_fee_per_gas: None,
            extra_data: Bytes::new(),
        }
    }

    fn transaction(block: &Block, index: u64) -> Transaction {
        Transaction {
            hash: B256::repeat_byte(0x40 + index as u8),
            block_number: block.number,
            block_hash: block.hash,
            transaction_index: index,
            from: Address::repeat_byte(1),
            to: Some(Address::repeat_byte(2)),
            value: U256::ZERO,
            input: Bytes::new(),
            nonce: 0,
            gas: 21_000,
            gas_price: None,
        }
    }

    fn log(block: &Block, tx: &Transaction, log_index: u64, topics: Vec<B256>) -> Log {
        Log {
            address: Address::repeat_byte(0xaa),
            topics,
            data: Bytes::new(),
            block_number: block.number,
            block_hash: block.hash,
            block_timestamp: block.timestamp,
            transaction_hash: tx.hash,
            transaction_index: tx.transaction_index,
            log_index,
        }
    }

    fn source() -> Source {
        Source {
            name: "Token".into(),
            network: "mainnet".into(),
            chain_id: 1,
            address: AddressCriteria::Single(Address::repeat_byte(0xaa)),
            events: vec![AbiEvent::parse("Transfer(address,address,uint256)").unwrap()],
            filter: LogFilter::default(),
            start_block: 100,
            end_block: None,
            include_transaction_receipts: false,
        }
    }

    #[test]
    fn builds_ordered_log_events() {
        let source = source();
        let topic0 = source.events[0].topic0;
        let blk = block(100, 1000);
        let tx0 = transaction(&blk, 0);
        let tx1 = transaction(&blk, 1);
        // Out of order on purpose.
        let logs = vec![
            log(&blk, &tx1, 5, vec![topic0]),
            log(&blk, &tx0, 1, vec![topic0]),
            log(&blk, &tx0, 0, vec![B256::repeat_byte(9)]), // unmatched topic
        ];
        let events = build_events(
            1,
            &blk,
            &logs,
            &[tx0, tx1],
            &[],
            std::slice::from_ref(&source),
            &HashMap::new(),
        );
        assert_eq!(events.len(), 2);
        assert!(events[0].checkpoint() < events[1].checkpoint());
        assert_eq!(events[0].event_name(), "Transfer");
        assert_eq!(events[0].checkpoint().event_index, 1);
        assert_eq!(events[1].checkpoint().event_index, 5);
    }

    #[test]
    fn respects_source_block_range() {
        let mut src = source();
        src.start_block = 101;
        let blk = block(100, 1000);
        let tx = transaction(&blk, 0);
        let logs = vec![log(&blk, &tx, 0, vec![src.events[0].topic0])];
        let events = build_events(1, &blk, &logs, &[tx], &[], &[src], &HashMap::new());
        assert!(events.is_empty());
    }
}
