//! Realtime sync: tip polling, reorg detection, finalized flushing.
//!
//! Per chain, a polling loop watches `eth_getBlockByNumber("latest")` and
//! maintains the canonical chain, the sliding window of unfinalized blocks
//! between the finalized boundary and the observed head. New heads either
//! extend the window, trigger a walkback to a common ancestor (reorg), or,
//! when no ancestor exists within the finality window, stop the instance.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use futures::future::try_join_all;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain_data::{Block, Log, Transaction, TransactionReceipt};
use crate::checkpoint::Checkpoint;
use crate::config::NetworkConfig;
use crate::event::build_events;
use crate::rpc::{RpcClient, RpcError};
use crate::source::{AddressCriteria, Source};
use crate::sync::cache::{ChunkData, SyncCache};
use crate::sync::{ChainMessage, SyncError};

/// The in-memory window of unfinalized blocks, oldest first. Entries are
/// hash-linked; the front sits just above the finalized boundary.
#[derive(Debug, Default)]
pub struct CanonicalChain {
    blocks: VecDeque<Block>,
}

impl CanonicalChain {
    pub fn new() -> Self {
        CanonicalChain::default()
    }

    pub fn tip(&self) -> Option<&Block> {
        self.blocks.back()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: B256) -> bool {
        self.blocks.iter().any(|b| b.hash == hash)
    }

    /// Append a block that links to the current tip.
    pub fn push(&mut self, block: Block) {
        if let Some(tip) = self.tip() {
            debug_assert_eq!(block.parent_hash, tip.hash, "unlinked canonical append");
        }
        self.blocks.push_back(block);
    }

    /// Drop everything above `ancestor_hash`, returning the orphaned suffix
    /// tip-first order is not preserved; callers get oldest-first.
    pub fn truncate_after(&mut self, ancestor_hash: B256) -> Vec<Block> {
        let Some(position) = self.blocks.iter().position(|b| b.hash == ancestor_hash) else {
            return Vec::new();
        };
        self.blocks.split_off(position + 1).into()
    }

    /// Remove and return blocks at or below the new finalized height.
    pub fn drain_finalized(&mut self, finalized: u64) -> Vec<Block> {
        let mut drained = Vec::new();
        while let Some(front) = self.blocks.front() {
            if front.number <= finalized {
                drained.push(self.blocks.pop_front().expect("front just observed"));
            } else {
                break;
            }
        }
        drained
    }
}

/// Everything fetched eagerly for one unfinalized block.
#[derive(Debug, Clone, Default)]
struct BlockBundle {
    logs: Vec<Log>,
    transactions: Vec<Transaction>,
    receipts: Vec<TransactionReceipt>,
}

pub struct RealtimeSync {
    chain_id: u64,
    client: Arc<RpcClient>,
    cache: SyncCache,
    sources: Vec<Source>,
    sender: mpsc::Sender<ChainMessage>,
    use_cache: bool,
    finality_depth: u64,
    polling_interval: Duration,
    idle_timeout: Duration,
    chain: CanonicalChain,
    bundles: HashMap<B256, BlockBundle>,
    factory_children: HashMap<String, Vec<Address>>,
    finalized: u64,
    last_progress: Instant,
}

impl RealtimeSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: u64,
        network: &NetworkConfig,
        client: Arc<RpcClient>,
        cache: SyncCache,
        sources: Vec<Source>,
        sender: mpsc::Sender<ChainMessage>,
        finalized: u64,
        factory_children: HashMap<String, Vec<Address>>,
    ) -> Self {
        RealtimeSync {
            chain_id,
            client,
            cache,
            sources,
            sender,
            use_cache: !network.disable_cache,
            finality_depth: network.finality_depth,
            polling_interval: Duration::from_millis(network.polling_interval_ms),
            idle_timeout: Duration::from_millis(network.idle_timeout_ms),
            chain: CanonicalChain::new(),
            bundles: HashMap::new(),
            factory_children,
            finalized,
            last_progress: Instant::now(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SyncError> {
        let mut ticker = interval(self.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(chain_id = self.chain_id, finalized = self.finalized, "realtime sync starting");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll().await {
                        Ok(()) => {}
                        Err(SyncError::Rpc(rpc)) if rpc.is_transient() => {
                            warn!(chain_id = self.chain_id, error = %rpc, "transient poll failure");
                        }
                        Err(SyncError::DeepReorg { chain_id, depth }) => {
                            error!(chain_id, depth, "deep reorg past the finality window");
                            let _ = self
                                .sender
                                .send(ChainMessage::DeepReorg { chain_id })
                                .await;
                            return Err(SyncError::DeepReorg { chain_id, depth });
                        }
                        Err(SyncError::ChannelClosed) => return Ok(()),
                        Err(other) => {
                            warn!(chain_id = self.chain_id, error = %other, "poll failed");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(chain_id = self.chain_id, "realtime sync stopping");
                    return Ok(());
                }
            }
        }
    }

    async fn poll(&mut self) -> Result<(), SyncError> {
        let latest = self.client.get_latest_block().await?.into_block();

        // A head we already hold (including a stale response below the
        // tip) is not new information.
        if self.chain.contains(latest.hash) {
            return self.heartbeat().await;
        }
        if let Some(tip) = self.chain.tip() {
            if latest.parent_hash == tip.hash {
                self.process_block(latest).await?;
                return Ok(());
            }
        }

        // The head does not extend the tip (or the window is empty): walk
        // the parent links back to a known block.
        let (ancestor, suffix) = self.walk_back(latest).await?;
        if let Some(ancestor_hash) = ancestor {
            let is_reorg = self
                .chain
                .tip()
                .map(|tip| tip.hash != ancestor_hash)
                .unwrap_or(false);
            if is_reorg {
                let orphaned = self.chain.truncate_after(ancestor_hash);
                for block in &orphaned {
                    self.bundles.remove(&block.hash);
                }
                let ancestor_block = self
                    .chain
                    .tip()
                    .expect("ancestor remains after truncation");
                let checkpoint = Checkpoint::block_end(
                    ancestor_block.timestamp,
                    self.chain_id,
                    ancestor_block.number,
                );
                warn!(
                    chain_id = self.chain_id,
                    ancestor = ancestor_block.number,
                    depth = orphaned.len(),
                    "reorg detected"
                );
                self.send(ChainMessage::Reorg {
                    chain_id: self.chain_id,
                    ancestor: checkpoint,
                    depth: orphaned.len() as u64,
                })
                .await?;
            }
        }
        for block in suffix {
            self.process_block(block).await?;
        }
        Ok(())
    }

    /// Walk parent hashes from `head` until a block in the canonical chain.
    /// Returns the ancestor hash (`None` when seeding an empty window) and
    /// the new blocks oldest-first.
    async fn walk_back(&self, head: Block) -> Result<(Option<B256>, Vec<Block>), SyncError> {
        let mut suffix = vec![head];
        loop {
            let last = suffix.last().expect("suffix starts non-empty");
            if self.chain.contains(last.parent_hash) {
                let ancestor = last.parent_hash;
                suffix.reverse();
                return Ok((Some(ancestor), suffix));
            }
            if last.number <= self.finalized + 1 {
                if self.chain.is_empty() {
                    // First poll: the window seeds from the finalized
                    // boundary up to the head.
                    suffix.reverse();
                    return Ok((None, suffix));
                }
                return Err(SyncError::DeepReorg {
                    chain_id: self.chain_id,
                    depth: suffix.len() as u64,
                });
            }
            if suffix.len() as u64 > self.finality_depth {
                return Err(SyncError::DeepReorg {
                    chain_id: self.chain_id,
                    depth: suffix.len() as u64,
                });
            }
            let parent = self
                .client
                .get_block_by_hash(last.parent_hash, false)
                .await?
                .ok_or_else(|| {
                    SyncError::Rpc(RpcError::Malformed(format!(
                        "parent block {} missing from node",
                        last.parent_hash
                    )))
                })?
                .into_block();
            suffix.push(parent);
        }
    }

    /// Append a new canonical block: hydrate it, eagerly fetch its matching
    /// logs and receipts, emit events, and flush newly finalized blocks.
    async fn process_block(&mut self, header: Block) -> Result<(), SyncError> {
        let number = header.number;
        let hydrated = self
            .client
            .get_block_by_hash(header.hash, true)
            .await?
            .ok_or_else(|| {
                SyncError::Rpc(RpcError::Malformed(format!(
                    "block {number} vanished while hydrating"
                )))
            })?;
        let block = hydrated.clone().into_block();
        let all_transactions = hydrated.transactions();

        let logs = self.fetch_block_logs(&block).await?;
        let log_tx_hashes: BTreeSet<B256> = logs.iter().map(|l| l.transaction_hash).collect();
        let transactions: Vec<Transaction> = all_transactions
            .into_iter()
            .filter(|t| log_tx_hashes.contains(&t.hash))
            .collect();

        let wants_receipts = self
            .sources
            .iter()
            .any(|s| s.include_transaction_receipts);
        let receipts: Vec<TransactionReceipt> = if wants_receipts && !log_tx_hashes.is_empty() {
            try_join_all(
                log_tx_hashes
                    .iter()
                    .map(|&hash| self.client.get_transaction_receipt(hash)),
            )
            .await?
            .into_iter()
            .flatten()
            .map(|r| r.into_receipt())
            .collect()
        } else {
            Vec::new()
        };

        let events = build_events(
            self.chain_id,
            &block,
            &logs,
            &transactions,
            &receipts,
            &self.sources,
            &self.factory_children,
        );

        self.bundles.insert(
            block.hash,
            BlockBundle {
                logs,
                transactions,
                receipts,
            },
        );
        self.chain.push(block.clone());

        let watermark = Checkpoint::block_end(block.timestamp, self.chain_id, block.number);
        if events.is_empty() {
            self.send(ChainMessage::Watermark {
                chain_id: self.chain_id,
                watermark,
            })
            .await?;
        } else {
            debug!(
                chain_id = self.chain_id,
                block = block.number,
                events = events.len(),
                "realtime events"
            );
            self.send(ChainMessage::Events {
                chain_id: self.chain_id,
                events,
                watermark,
            })
            .await?;
        }
        self.last_progress = Instant::now();

        self.advance_finalized(block.number.saturating_sub(self.finality_depth))
            .await
    }

    /// Flush blocks that aged below the finality boundary into the cache
    /// and announce the new finalized checkpoint.
    async fn advance_finalized(&mut self, new_finalized: u64) -> Result<(), SyncError> {
        if new_finalized <= self.finalized {
            return Ok(());
        }
        let drained = self.chain.drain_finalized(new_finalized);
        self.finalized = new_finalized;
        self.cache.set_finalized(self.chain_id, new_finalized);

        let mut finalized_checkpoint = None;
        for block in drained {
            let bundle = self.bundles.remove(&block.hash).unwrap_or_default();
            finalized_checkpoint = Some(Checkpoint::block_end(
                block.timestamp,
                self.chain_id,
                block.number,
            ));
            if self.use_cache {
                let data = ChunkData {
                    blocks: vec![block],
                    transactions: bundle.transactions,
                    receipts: bundle.receipts,
                    logs: bundle.logs,
                    traces: Vec::new(),
                };
                self.cache.insert_chunk(self.chain_id, &data, None).await?;
            }
        }
        if let Some(checkpoint) = finalized_checkpoint {
            self.send(ChainMessage::Finalized {
                chain_id: self.chain_id,
                checkpoint,
            })
            .await?;
        }
        Ok(())
    }

    /// No new head this poll. After `idle_timeout` without progress, repeat
    /// the tip watermark so the merger does not stall on this chain.
    async fn heartbeat(&mut self) -> Result<(), SyncError> {
        if self.last_progress.elapsed() < self.idle_timeout {
            return Ok(());
        }
        if let Some(tip) = self.chain.tip() {
            let watermark = Checkpoint::block_end(tip.timestamp, self.chain_id, tip.number);
            self.send(ChainMessage::Watermark {
                chain_id: self.chain_id,
                watermark,
            })
            .await?;
        }
        self.last_progress = Instant::now();
        Ok(())
    }

    /// Addresses and topics the eager per-block log fetch must cover.
    async fn fetch_block_logs(&mut self, block: &Block) -> Result<Vec<Log>, SyncError> {
        let mut addresses: Vec<Address> = Vec::new();
        let mut topics: Vec<B256> = Vec::new();
        for source in &self.sources {
            match &source.address {
                AddressCriteria::Single(address) => {
                    if !addresses.contains(address) {
                        addresses.push(*address);
                    }
                }
                AddressCriteria::Factory(factory) => {
                    if !addresses.contains(&factory.address) {
                        addresses.push(factory.address);
                    }
                    if !topics.contains(&factory.event_topic0) {
                        topics.push(factory.event_topic0);
                    }
                    for child in self
                        .factory_children
                        .get(&source.name)
                        .map(Vec::as_slice)
                        .unwrap_or_default()
                    {
                        if !addresses.contains(child) {
                            addresses.push(*child);
                        }
                    }
                }
            }
            for topic0 in source.topic0_set() {
                if !topics.contains(&topic0) {
                    topics.push(topic0);
                }
            }
        }

        let raw = self
            .client
            .get_logs(block.number, block.number, &addresses, &topics)
            .await?;
        let logs: Vec<Log> = raw
            .iter()
            .filter(|l| !l.removed && l.block_hash == block.hash)
            .map(|l| l.to_log(block.timestamp))
            .collect();

        // Creation logs activate children within the same block: a second
        // fetch picks up their events.
        let mut discovered = Vec::new();
        for source in &self.sources {
            if let AddressCriteria::Factory(factory) = &source.address {
                let children = self.factory_children.entry(source.name.clone()).or_default();
                for log in &logs {
                    if let Some(child) = factory.child_address(log) {
                        if !children.contains(&child) {
                            children.push(child);
                            discovered.push(child);
                        }
                    }
                }
            }
        }
        if discovered.is_empty() {
            return Ok(logs);
        }
        let extra = self
            .client
            .get_logs(block.number, block.number, &discovered, &topics)
            .await?;
        let mut logs = logs;
        for raw in &extra {
            if raw.removed || raw.block_hash != block.hash {
                continue;
            }
            let log = raw.to_log(block.timestamp);
            if !logs
                .iter()
                .any(|existing| existing.log_index == log.log_index)
            {
                logs.push(log);
            }
        }
        logs.sort_by_key(|l| l.log_index);
        Ok(logs)
    }

    async fn send(&self, message: ChainMessage) -> Result<(), SyncError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;

    fn block(number: u64, hash: u8, parent: u8) -> Block {
        Block {
            number,
            hash: B256::repeat_byte(hash),
            parent_hash: B256::repeat_byte(parent),
            timestamp: number * 10,
            miner: Address::ZERO,
            gas_used: 0,
            gas_limit: 0,
            base_fee_per_gas: None,
            extra_data: Bytes::new(),
        }
    }

    #[test]
    fn truncate_after_returns_the_orphaned_suffix() {
        let mut chain = CanonicalChain::new();
        chain.push(block(100, 1, 0));
        chain.push(block(101, 2, 1));
        chain.push(block(102, 3, 2));
        chain.push(block(103, 4, 3));

        let orphaned = chain.truncate_after(B256::repeat_byte(2));
        assert_eq!(orphaned.len(), 2);
        assert_eq!(orphaned[0].number, 102);
        assert_eq!(orphaned[1].number, 103);
        assert_eq!(chain.tip().unwrap().number, 101);
    }

    #[test]
    fn truncate_after_unknown_ancestor_is_a_no_op() {
        let mut chain = CanonicalChain::new();
        chain.push(block(100, 1, 0));
        assert!(chain.truncate_after(B256::repeat_byte(9)).is_empty());
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn drain_finalized_pops_from_the_front() {
        let mut chain = CanonicalChain::new();
        for (n, h, p) in [(100, 1, 0), (101, 2, 1), (102, 3, 2)] {
            chain.push(block(n, h, p));
        }
        let drained = chain.drain_finalized(101);
        assert_eq!(drained.iter().map(|b| b.number).collect::<Vec<_>>(), vec![100, 101]);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.tip().unwrap().number, 102);

        // Nothing left at or below the boundary.
        assert!(chain.drain_finalized(101).is_empty());
    }

    #[test]
    fn contains_checks_the_whole_window() {
        let mut chain = CanonicalChain::new();
        chain.push(block(100, 1, 0));
        chain.push(block(101, 2, 1));
        assert!(chain.contains(B256::repeat_byte(1)));
        assert!(chain.contains(B256::repeat_byte(2)));
        assert!(!chain.contains(B256::repeat_byte(3)));
    }
}
