//! Historical backfill.
//!
//! Walks each chain from the earliest source start block to the finalized
//! tip in planner-sized windows. Per window and source, data is served from
//! the sync cache when its interval bookkeeping says the range is covered,
//! and fetched over RPC otherwise; fetched data is committed to the cache in
//! one transaction with its interval row. Events are built and emitted in
//! checkpoint order as each window completes.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::{Address, B256};
use futures::future::try_join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain_data::{Block, Log, Transaction, TransactionReceipt};
use crate::checkpoint::Checkpoint;
use crate::event::{build_events, Event};
use crate::metrics::Metrics;
use crate::rpc::{RpcClient, RpcError};
use crate::source::{AddressCriteria, Source};
use crate::sync::cache::{ChunkData, SyncCache};
use crate::sync::intervals::IntervalSet;
use crate::sync::{ChainMessage, SyncError};

pub const INITIAL_CHUNK_SIZE: u64 = 10_000;
pub const MIN_CHUNK_SIZE: u64 = 128;
const GROW_AFTER_SUCCESSES: u32 = 3;
/// Permanent RPC failures may stall a chain this long before turning fatal.
const BLOCKED_ESCALATION: Duration = Duration::from_secs(300);
const BLOCKED_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Adaptive bisection of fetch windows: halve on oversized responses, double
/// back after three consecutive successes, capped by a per-chain ceiling.
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    size: u64,
    ceiling: u64,
    successes: u32,
}

impl ChunkPlanner {
    pub fn new(ceiling: u64) -> Self {
        ChunkPlanner {
            size: INITIAL_CHUNK_SIZE.min(ceiling.max(MIN_CHUNK_SIZE)),
            ceiling: ceiling.max(MIN_CHUNK_SIZE),
            successes: 0,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.size
    }

    pub fn on_too_large(&mut self) {
        self.size = (self.size / 2).max(MIN_CHUNK_SIZE);
        self.successes = 0;
    }

    pub fn on_success(&mut self) {
        self.successes += 1;
        if self.successes >= GROW_AFTER_SUCCESSES {
            self.size = (self.size * 2).min(self.ceiling);
            self.successes = 0;
        }
    }
}

pub struct HistoricalSync {
    chain_id: u64,
    client: Arc<RpcClient>,
    cache: SyncCache,
    sources: Vec<Source>,
    sender: mpsc::Sender<ChainMessage>,
    use_cache: bool,
    planner: ChunkPlanner,
    metrics: Option<Arc<Metrics>>,
}

/// Outcome of a finished backfill, handed to the realtime sync.
pub struct HistoricalOutcome {
    pub finalized_block: u64,
    pub finalized_checkpoint: Checkpoint,
    pub factory_children: HashMap<String, Vec<Address>>,
}

impl HistoricalSync {
    pub fn new(
        chain_id: u64,
        client: Arc<RpcClient>,
        cache: SyncCache,
        sources: Vec<Source>,
        sender: mpsc::Sender<ChainMessage>,
        use_cache: bool,
        chunk_ceiling: u64,
    ) -> Self {
        HistoricalSync {
            chain_id,
            client,
            cache,
            sources,
            sender,
            use_cache,
            planner: ChunkPlanner::new(chunk_ceiling),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the backfill to the chain's finalized tip.
    pub async fn run(
        mut self,
        finalized_block: u64,
        shutdown: CancellationToken,
    ) -> Result<HistoricalOutcome, SyncError> {
        let chain_id = self.chain_id;
        let Some(first_block) = self.sources.iter().map(|s| s.start_block).min() else {
            // No sources on this chain; nothing to replay.
            self.send(ChainMessage::HistoricalComplete { chain_id }).await?;
            return Ok(HistoricalOutcome {
                finalized_block,
                finalized_checkpoint: Checkpoint::block_start(0, chain_id, finalized_block),
                factory_children: HashMap::new(),
            });
        };

        // Setup events precede every log event of their contract; timestamp
        // zero keeps them ahead of real blocks in the total order.
        let mut setups: Vec<Event> = self
            .sources
            .iter()
            .map(|source| Event::Setup {
                checkpoint: source.setup_checkpoint(0),
                contract: source.name.clone(),
            })
            .collect();
        setups.sort_by_key(|e| e.checkpoint());
        let setup_watermark = setups.last().map(|e| e.checkpoint()).unwrap_or(Checkpoint::ZERO);
        self.send(ChainMessage::Events {
            chain_id,
            events: setups,
            watermark: setup_watermark,
        })
        .await?;

        let mut covered: HashMap<String, IntervalSet> = HashMap::new();
        if self.use_cache {
            for source in &self.sources {
                let set = self.cache.get_intervals(chain_id, &source.fingerprint()).await?;
                covered.insert(source.name.clone(), set);
            }
        }

        let mut factory_children: HashMap<String, Vec<Address>> = HashMap::new();
        let mut cursor = first_block;
        let mut blocked_since: Option<(Instant, String)> = None;

        info!(
            chain_id,
            from = first_block,
            to = finalized_block,
            "historical sync starting"
        );

        while cursor <= finalized_block {
            if shutdown.is_cancelled() {
                return Err(SyncError::ChannelClosed);
            }
            let window_end = cursor
                .saturating_add(self.planner.chunk_size() - 1)
                .min(finalized_block);

            match self
                .sync_window(cursor, window_end, &mut covered, &mut factory_children)
                .await
            {
                Ok(events) => {
                    blocked_since = None;
                    self.planner.on_success();
                    let watermark = events
                        .last()
                        .map(|e| e.checkpoint())
                        .unwrap_or(Checkpoint::ZERO);
                    if events.is_empty() {
                        debug!(chain_id, cursor, window_end, "window empty");
                    } else {
                        self.send(ChainMessage::Events {
                            chain_id,
                            events,
                            watermark,
                        })
                        .await?;
                    }
                    cursor = window_end + 1;
                }
                Err(SyncError::Rpc(error)) if error.is_too_large() => {
                    warn!(chain_id, cursor, window_end, %error, "bisecting window");
                    self.planner.on_too_large();
                }
                Err(SyncError::Rpc(error)) if !error.is_transient() => {
                    // Permanent errors abort the fetch; a chain stuck on them
                    // for too long takes the instance down.
                    let (since, _) = blocked_since
                        .get_or_insert_with(|| (Instant::now(), error.to_string()));
                    if since.elapsed() >= BLOCKED_ESCALATION {
                        return Err(SyncError::Blocked {
                            chain_id,
                            seconds: BLOCKED_ESCALATION.as_secs(),
                            detail: error.to_string(),
                        });
                    }
                    warn!(chain_id, cursor, %error, "permanent rpc error, will replan");
                    tokio::select! {
                        _ = tokio::time::sleep(BLOCKED_RETRY_DELAY) => {}
                        _ = shutdown.cancelled() => return Err(SyncError::ChannelClosed),
                    }
                }
                Err(other) => return Err(other),
            }
        }

        // Anchor the final watermark at the finalized block itself so the
        // merger can release every event at or below it.
        let finalized_header = self
            .client
            .get_block_by_number(finalized_block, false)
            .await?
            .ok_or_else(|| {
                SyncError::Rpc(RpcError::Malformed(format!(
                    "finalized block {finalized_block} missing from node"
                )))
            })?;
        let finalized_checkpoint =
            Checkpoint::block_end(finalized_header.timestamp, chain_id, finalized_block);
        self.send(ChainMessage::Watermark {
            chain_id,
            watermark: finalized_checkpoint,
        })
        .await?;
        self.send(ChainMessage::HistoricalComplete { chain_id }).await?;

        if self.use_cache {
            for source in &self.sources {
                self.cache
                    .compact_intervals(chain_id, &source.fingerprint())
                    .await?;
            }
        }

        info!(chain_id, finalized_block, "historical sync complete");
        Ok(HistoricalOutcome {
            finalized_block,
            finalized_checkpoint,
            factory_children,
        })
    }

    /// Sync one window for every source and build its ordered events.
    async fn sync_window(
        &self,
        from_block: u64,
        to_block: u64,
        covered: &mut HashMap<String, IntervalSet>,
        factory_children: &mut HashMap<String, Vec<Address>>,
    ) -> Result<Vec<Event>, SyncError> {
        let mut window_logs: Vec<Log> = Vec::new();
        let mut window_blocks: HashMap<B256, Block> = HashMap::new();
        let mut window_transactions: HashMap<B256, Transaction> = HashMap::new();
        let mut window_receipts: HashMap<B256, TransactionReceipt> = HashMap::new();

        for source in &self.sources {
            let source_from = from_block.max(source.start_block);
            let source_to = match source.end_block {
                Some(end) => to_block.min(end),
                None => to_block,
            };
            if source_from > source_to {
                continue;
            }

            let cached = self.use_cache
                && covered
                    .get(&source.name)
                    .map(|set| set.covers(source_from, source_to))
                    .unwrap_or(false);

            if cached {
                if let Some(metrics) = &self.metrics {
                    metrics.cache_hits.inc();
                }
                let logs = self.cache.get_logs(self.chain_id, source_from, source_to).await?;
                let blocks = self
                    .cache
                    .get_blocks(self.chain_id, source_from, source_to)
                    .await?;
                let transactions = self
                    .cache
                    .get_transactions(self.chain_id, source_from, source_to)
                    .await?;
                let receipts = self
                    .cache
                    .get_receipts(self.chain_id, source_from, source_to)
                    .await?;
                // Factory children must be re-derived from the cached
                // creation logs before matching.
                if let AddressCriteria::Factory(factory) = &source.address {
                    let children = factory_children.entry(source.name.clone()).or_default();
                    for log in &logs {
                        if let Some(child) = factory.child_address(log) {
                            if !children.contains(&child) {
                                children.push(child);
                            }
                        }
                    }
                }
                merge_window(
                    &mut window_logs,
                    &mut window_blocks,
                    &mut window_transactions,
                    &mut window_receipts,
                    logs,
                    blocks,
                    transactions,
                    receipts,
                );
                continue;
            }

            if let Some(metrics) = &self.metrics {
                metrics.cache_misses.inc();
            }
            let chunk = self
                .fetch_source_window(source, source_from, source_to, factory_children)
                .await?;
            if self.use_cache {
                self.cache
                    .insert_chunk(
                        self.chain_id,
                        &chunk,
                        Some((&source.fingerprint(), source_from, source_to)),
                    )
                    .await?;
                covered
                    .entry(source.name.clone())
                    .or_default()
                    .insert(source_from, source_to);
            }
            merge_window(
                &mut window_logs,
                &mut window_blocks,
                &mut window_transactions,
                &mut window_receipts,
                chunk.logs,
                chunk.blocks,
                chunk.transactions,
                chunk.receipts,
            );
        }

        // Build per block so every event carries its enclosing block.
        let mut events = Vec::new();
        let transactions: Vec<Transaction> = window_transactions.into_values().collect();
        let receipts: Vec<TransactionReceipt> = window_receipts.into_values().collect();
        for block in window_blocks.values() {
            let block_logs: Vec<Log> = window_logs
                .iter()
                .filter(|l| l.block_hash == block.hash)
                .cloned()
                .collect();
            events.extend(build_events(
                self.chain_id,
                block,
                &block_logs,
                &transactions,
                &receipts,
                &self.sources,
                factory_children,
            ));
        }
        events.sort_by_key(|e| e.checkpoint());
        Ok(events)
    }

    /// Fetch one source's window over RPC: logs first, then the enclosing
    /// blocks (hydrated), then receipts when the source asked for them.
    async fn fetch_source_window(
        &self,
        source: &Source,
        from_block: u64,
        to_block: u64,
        factory_children: &mut HashMap<String, Vec<Address>>,
    ) -> Result<ChunkData, SyncError> {
        let topic0 = source.topic0_set();
        let mut raw_logs = Vec::new();

        match &source.address {
            AddressCriteria::Single(address) => {
                raw_logs.extend(
                    self.client
                        .get_logs(from_block, to_block, &[*address], &topic0)
                        .await?,
                );
            }
            AddressCriteria::Factory(factory) => {
                // Creation logs first so children discovered in this window
                // are matched within it.
                let creations = self
                    .client
                    .get_logs(
                        from_block,
                        to_block,
                        &[factory.address],
                        &[factory.event_topic0],
                    )
                    .await?;
                let children = factory_children.entry(source.name.clone()).or_default();
                for raw in &creations {
                    let log = raw.to_log(0);
                    if let Some(child) = factory.child_address(&log) {
                        if !children.contains(&child) {
                            children.push(child);
                        }
                    }
                }
                raw_logs.extend(creations);
                if !children.is_empty() {
                    raw_logs.extend(
                        self.client
                            .get_logs(from_block, to_block, children, &topic0)
                            .await?,
                    );
                }
            }
        }
        raw_logs.retain(|l| !l.removed);

        let block_numbers: BTreeSet<u64> = raw_logs.iter().map(|l| l.block_number).collect();
        let fetched_blocks = try_join_all(
            block_numbers
                .iter()
                .map(|&number| self.client.get_block_by_number(number, true)),
        )
        .await?;

        let mut data = ChunkData::default();
        let log_tx_hashes: BTreeSet<B256> = raw_logs.iter().map(|l| l.transaction_hash).collect();
        let mut timestamps: HashMap<u64, u64> = HashMap::new();
        for rpc_block in fetched_blocks.into_iter().flatten() {
            timestamps.insert(rpc_block.number, rpc_block.timestamp);
            data.transactions.extend(
                rpc_block
                    .transactions()
                    .into_iter()
                    .filter(|t| log_tx_hashes.contains(&t.hash)),
            );
            data.blocks.push(rpc_block.into_block());
        }

        data.logs = raw_logs
            .iter()
            .map(|raw| raw.to_log(timestamps.get(&raw.block_number).copied().unwrap_or(0)))
            .collect();

        if source.include_transaction_receipts {
            let receipts = try_join_all(
                log_tx_hashes
                    .iter()
                    .map(|&hash| self.client.get_transaction_receipt(hash)),
            )
            .await?;
            data.receipts = receipts
                .into_iter()
                .flatten()
                .map(|r| r.into_receipt())
                .collect();
        }

        debug!(
            chain_id = self.chain_id,
            source = %source.name,
            from_block,
            to_block,
            logs = data.logs.len(),
            "window fetched"
        );
        Ok(data)
    }

    async fn send(&self, message: ChainMessage) -> Result<(), SyncError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

#[allow(clippy::too_many_arguments)]
fn merge_window(
    window_logs: &mut Vec<Log>,
    window_blocks: &mut HashMap<B256, Block>,
    window_transactions: &mut HashMap<B256, Transaction>,
    window_receipts: &mut HashMap<B256, TransactionReceipt>,
    logs: Vec<Log>,
    blocks: Vec<Block>,
    transactions: Vec<Transaction>,
    receipts: Vec<TransactionReceipt>,
) {
    for log in logs {
        if !window_logs.iter().any(|existing| {
            existing.block_hash == log.block_hash && existing.log_index == log.log_index
        }) {
            window_logs.push(log);
        }
    }
    for block in blocks {
        window_blocks.entry(block.hash).or_insert(block);
    }
    for transaction in transactions {
        window_transactions.entry(transaction.hash).or_insert(transaction);
    }
    for receipt in receipts {
        window_receipts.entry(receipt.transaction_hash).or_insert(receipt);
    }
}
