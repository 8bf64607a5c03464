//! Chain synchronization: durable cache, historical backfill, realtime
//! polling, and the cross-chain event stream merger.

pub mod cache;
pub mod historical;
pub mod intervals;
pub mod merger;
pub mod realtime;

use thiserror::Error;

use crate::checkpoint::Checkpoint;
use crate::event::Event;
use crate::rpc::RpcError;
use crate::sync::cache::SyncCacheError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Cache(#[from] SyncCacheError),

    #[error("chain {chain_id}: no common ancestor within {depth} blocks")]
    DeepReorg { chain_id: u64, depth: u64 },

    #[error("chain {chain_id}: historical progress blocked for over {seconds}s: {detail}")]
    Blocked {
        chain_id: u64,
        seconds: u64,
        detail: String,
    },

    #[error("event channel closed")]
    ChannelClosed,
}

/// What a per-chain sync task reports into the merger.
#[derive(Debug)]
pub enum ChainMessage {
    /// Ordered events plus the chain's new watermark: every event at or
    /// below the watermark for this chain has been reported.
    Events {
        chain_id: u64,
        events: Vec<Event>,
        watermark: Checkpoint,
    },
    /// Watermark-only heartbeat (idle chains, empty polls).
    Watermark {
        chain_id: u64,
        watermark: Checkpoint,
    },
    /// Historical backfill for this chain is complete; realtime follows.
    HistoricalComplete { chain_id: u64 },
    /// A reorg below the tip: events after `ancestor` must be unwound.
    Reorg {
        chain_id: u64,
        ancestor: Checkpoint,
        depth: u64,
    },
    /// The chain's finalized boundary advanced; journal rows at or below
    /// the min across chains can be pruned.
    Finalized {
        chain_id: u64,
        checkpoint: Checkpoint,
    },
    /// No common ancestor within the finality window. Fatal.
    DeepReorg { chain_id: u64 },
}
