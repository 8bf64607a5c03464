//! Cross-chain event stream merger.
//!
//! A low-watermark join: each chain reports ordered events plus a watermark
//! promising that everything at or below it has been reported. An event is
//! released only once every chain's watermark has reached its checkpoint, so
//! the output is a single stream in global checkpoint order.
//!
//! Delivered events above the finalized boundary are retained in a replay
//! ring; on a reorg they are re-queued so unaffected chains' events are
//! re-delivered after the journal rollback, exactly as a resumed merger
//! would have produced them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::event::Event;
use crate::metrics::ChainLabels;
use crate::state::AppState;
use crate::sync::{ChainMessage, SyncError};

/// Bound on buffered (not yet released) events across all chains.
pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// What the merger hands to the indexing runner.
#[derive(Debug)]
pub enum IndexingMessage {
    /// Ordered, release-safe events.
    Events(Vec<Event>),
    /// Unwind user state back to `ancestor` before continuing.
    Reorg {
        chain_id: u64,
        ancestor: Checkpoint,
        depth: u64,
    },
    /// The global finalized checkpoint advanced; journal rows at or below
    /// it can be pruned.
    Finalized(Checkpoint),
    /// Every chain finished its backfill; time for the live-view cutover.
    HistoricalComplete,
    /// A chain saw a reorg deeper than its finality window.
    Fatal { chain_id: u64 },
}

/// The pure merge state, separated from the task for testability.
pub struct MergerCore {
    buffers: HashMap<u64, VecDeque<Event>>,
    watermarks: HashMap<u64, Checkpoint>,
    finalized: HashMap<u64, Checkpoint>,
    /// Delivered events above the finalized boundary, for reorg re-delivery.
    replay: VecDeque<Event>,
    buffer_size: usize,
}

impl MergerCore {
    pub fn new(chain_ids: impl IntoIterator<Item = u64>, buffer_size: usize) -> Self {
        let mut buffers = HashMap::new();
        let mut watermarks = HashMap::new();
        for chain_id in chain_ids {
            buffers.insert(chain_id, VecDeque::new());
            watermarks.insert(chain_id, Checkpoint::ZERO);
        }
        MergerCore {
            buffers,
            watermarks,
            finalized: HashMap::new(),
            replay: VecDeque::new(),
            buffer_size,
        }
    }

    pub fn push_events(&mut self, chain_id: u64, events: Vec<Event>) {
        if let Some(buffer) = self.buffers.get_mut(&chain_id) {
            buffer.extend(events);
        }
    }

    /// Watermarks only move forward, except through `reorg`.
    pub fn set_watermark(&mut self, chain_id: u64, watermark: Checkpoint) {
        if let Some(current) = self.watermarks.get_mut(&chain_id) {
            if watermark > *current {
                *current = watermark;
            }
        }
    }

    /// Min over chains of the highest reported watermark.
    pub fn safe_checkpoint(&self) -> Checkpoint {
        self.watermarks
            .values()
            .copied()
            .min()
            .unwrap_or(Checkpoint::ZERO)
    }

    pub fn buffered(&self) -> usize {
        self.buffers.values().map(VecDeque::len).sum()
    }

    pub fn is_full(&self) -> bool {
        self.buffered() >= self.buffer_size
    }

    /// Release every buffered event at or below the safe checkpoint, in
    /// global order. Released events enter the replay ring.
    pub fn drain_ready(&mut self) -> Vec<Event> {
        let safe = self.safe_checkpoint();
        let mut ready = Vec::new();
        for buffer in self.buffers.values_mut() {
            while let Some(front) = buffer.front() {
                if front.checkpoint() <= safe {
                    ready.push(buffer.pop_front().expect("front just observed"));
                } else {
                    break;
                }
            }
        }
        ready.sort_by_key(|e| e.checkpoint());
        self.replay.extend(ready.iter().cloned());
        while self.replay.len() > self.buffer_size {
            self.replay.pop_front();
        }
        ready
    }

    /// Unwind chain `chain_id` to `ancestor`: orphaned buffered events are
    /// dropped, the chain's watermark rewinds, and already-delivered events
    /// of other chains above the ancestor are re-queued for re-delivery.
    pub fn reorg(&mut self, chain_id: u64, ancestor: Checkpoint) {
        if let Some(buffer) = self.buffers.get_mut(&chain_id) {
            buffer.retain(|event| event.checkpoint() <= ancestor);
        }
        if let Some(watermark) = self.watermarks.get_mut(&chain_id) {
            if ancestor < *watermark {
                *watermark = ancestor;
            }
        }
        let mut requeue: Vec<Event> = Vec::new();
        self.replay.retain(|event| {
            if event.checkpoint() > ancestor {
                if event.chain_id() != chain_id {
                    requeue.push(event.clone());
                }
                false
            } else {
                true
            }
        });
        for event in requeue {
            if let Some(buffer) = self.buffers.get_mut(&event.chain_id()) {
                let position = buffer
                    .iter()
                    .position(|e| e.checkpoint() > event.checkpoint())
                    .unwrap_or(buffer.len());
                buffer.insert(position, event);
            }
        }
    }

    /// Record a chain's finalized checkpoint and prune the replay ring
    /// below the global (min) finalized boundary, which no reorg can reach.
    pub fn set_finalized(&mut self, chain_id: u64, checkpoint: Checkpoint) -> Option<Checkpoint> {
        self.finalized.insert(chain_id, checkpoint);
        if self.finalized.len() < self.buffers.len() {
            return None;
        }
        let global = self.finalized.values().copied().min()?;
        while let Some(front) = self.replay.front() {
            if front.checkpoint() <= global {
                self.replay.pop_front();
            } else {
                break;
            }
        }
        Some(global)
    }
}

pub struct EventMerger {
    core: MergerCore,
    receiver: mpsc::Receiver<ChainMessage>,
    output: mpsc::Sender<IndexingMessage>,
    state: Arc<AppState>,
    pending_historical: usize,
    last_finalized: Option<Checkpoint>,
    /// Block number of the last released event, per chain; feeds the lag
    /// gauge.
    released: HashMap<u64, u64>,
}

impl EventMerger {
    pub fn new(
        chain_ids: Vec<u64>,
        receiver: mpsc::Receiver<ChainMessage>,
        output: mpsc::Sender<IndexingMessage>,
        state: Arc<AppState>,
    ) -> Self {
        let pending_historical = chain_ids.len();
        EventMerger {
            core: MergerCore::new(chain_ids, DEFAULT_BUFFER_SIZE),
            receiver,
            output,
            state,
            pending_historical,
            last_finalized: None,
            released: HashMap::new(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SyncError> {
        loop {
            tokio::select! {
                message = self.receiver.recv() => {
                    let Some(message) = message else {
                        info!("all chain streams closed, merger stopping");
                        return Ok(());
                    };
                    if !self.handle(message).await? {
                        return Ok(());
                    }
                }
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// Returns false when the merger should stop.
    async fn handle(&mut self, message: ChainMessage) -> Result<bool, SyncError> {
        match message {
            ChainMessage::Events {
                chain_id,
                events,
                watermark,
            } => {
                self.state
                    .update_chain(chain_id, watermark.block_number, watermark.block_timestamp);
                self.state
                    .metrics
                    .sync_block
                    .get_or_create(&ChainLabels { chain_id })
                    .set(watermark.block_number as i64);
                let released = self.released.get(&chain_id).copied().unwrap_or(0);
                self.state
                    .metrics
                    .sync_lag
                    .get_or_create(&ChainLabels { chain_id })
                    .set(watermark.block_number.saturating_sub(released) as i64);
                self.core.push_events(chain_id, events);
                self.core.set_watermark(chain_id, watermark);
                self.flush().await?;
            }
            ChainMessage::Watermark { chain_id, watermark } => {
                self.state
                    .update_chain(chain_id, watermark.block_number, watermark.block_timestamp);
                self.core.set_watermark(chain_id, watermark);
                self.flush().await?;
            }
            ChainMessage::HistoricalComplete { chain_id } => {
                self.state.mark_realtime(chain_id);
                self.pending_historical = self.pending_historical.saturating_sub(1);
                if self.pending_historical == 0 {
                    info!("historical backfill complete on every chain");
                    self.send(IndexingMessage::HistoricalComplete).await?;
                }
            }
            ChainMessage::Reorg {
                chain_id,
                ancestor,
                depth,
            } => {
                warn!(chain_id, depth, %ancestor, "merger unwinding reorg");
                self.state
                    .metrics
                    .reorgs
                    .get_or_create(&ChainLabels { chain_id })
                    .inc();
                self.core.reorg(chain_id, ancestor);
                self.send(IndexingMessage::Reorg {
                    chain_id,
                    ancestor,
                    depth,
                })
                .await?;
                self.flush().await?;
            }
            ChainMessage::Finalized { chain_id, checkpoint } => {
                if let Some(global) = self.core.set_finalized(chain_id, checkpoint) {
                    if self.last_finalized.map(|f| global > f).unwrap_or(true) {
                        self.last_finalized = Some(global);
                        self.send(IndexingMessage::Finalized(global)).await?;
                    }
                }
            }
            ChainMessage::DeepReorg { chain_id } => {
                error!(chain_id, "deep reorg reported, stopping");
                self.send(IndexingMessage::Fatal { chain_id }).await?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn flush(&mut self) -> Result<(), SyncError> {
        let ready = self.core.drain_ready();
        self.state
            .metrics
            .buffered_events
            .set(self.core.buffered() as i64);
        if !ready.is_empty() {
            for event in &ready {
                self.released
                    .insert(event.chain_id(), event.checkpoint().block_number);
            }
            self.send(IndexingMessage::Events(ready)).await?;
        }
        Ok(())
    }

    async fn send(&self, message: IndexingMessage) -> Result<(), SyncError> {
        // The bounded channel is the backpressure boundary: when the runner
        // falls behind, this send parks, the input channel fills, and the
        // sync tasks pause upstream.
        self.output
            .send(message)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(chain_id: u64, timestamp: u64, block: u64, index: u64) -> Event {
        Event::Setup {
            checkpoint: Checkpoint {
                block_timestamp: timestamp,
                chain_id,
                block_number: block,
                transaction_index: 0,
                event_index: index,
            },
            contract: format!("c{chain_id}"),
        }
    }

    fn watermark(chain_id: u64, timestamp: u64, block: u64) -> Checkpoint {
        Checkpoint::block_end(timestamp, chain_id, block)
    }

    #[test]
    fn holds_events_until_every_chain_catches_up() {
        let mut core = MergerCore::new([1, 2], 100);
        core.push_events(1, vec![event(1, 1000, 10, 0)]);
        core.set_watermark(1, watermark(1, 1000, 10));
        // Chain 2 has reported nothing: nothing releases.
        assert!(core.drain_ready().is_empty());

        core.set_watermark(2, watermark(2, 999, 50));
        // Chain 2's watermark (ts 999) is still below the event (ts 1000).
        assert!(core.drain_ready().is_empty());

        core.set_watermark(2, watermark(2, 1001, 51));
        let ready = core.drain_ready();
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn releases_in_global_checkpoint_order() {
        let mut core = MergerCore::new([1, 2], 100);
        core.push_events(1, vec![event(1, 1000, 10, 0), event(1, 1001, 11, 0)]);
        core.push_events(2, vec![event(2, 999, 50, 0)]);
        core.set_watermark(1, watermark(1, 1001, 11));
        core.set_watermark(2, watermark(2, 1002, 52));

        let ready = core.drain_ready();
        let timestamps: Vec<u64> = ready
            .iter()
            .map(|e| e.checkpoint().block_timestamp)
            .collect();
        assert_eq!(timestamps, vec![999, 1000, 1001]);
        assert_eq!(ready[0].chain_id(), 2);
    }

    #[test]
    fn safe_checkpoint_is_the_minimum_watermark() {
        let mut core = MergerCore::new([1, 2], 100);
        core.set_watermark(1, watermark(1, 1000, 10));
        assert_eq!(core.safe_checkpoint(), Checkpoint::ZERO);
        core.set_watermark(2, watermark(2, 500, 5));
        assert_eq!(core.safe_checkpoint().block_timestamp, 500);
    }

    #[test]
    fn watermarks_do_not_move_backwards() {
        let mut core = MergerCore::new([1], 100);
        core.set_watermark(1, watermark(1, 1000, 10));
        core.set_watermark(1, watermark(1, 900, 9));
        assert_eq!(core.safe_checkpoint().block_timestamp, 1000);
    }

    #[test]
    fn reorg_drops_orphans_and_requeues_other_chains() {
        let mut core = MergerCore::new([1, 2], 100);
        // Both chains deliver through ts 1040.
        core.push_events(
            1,
            vec![event(1, 1010, 101, 0), event(1, 1030, 103, 0), event(1, 1040, 104, 0)],
        );
        core.push_events(2, vec![event(2, 1020, 51, 0)]);
        core.set_watermark(1, watermark(1, 1040, 104));
        core.set_watermark(2, watermark(2, 1050, 52));
        let delivered = core.drain_ready();
        assert_eq!(delivered.len(), 4);

        // Chain 1 reorgs back to block 102 (ts 1020).
        let ancestor = Checkpoint::block_end(1020, 1, 102);
        core.reorg(1, ancestor);

        // Chain 2's event above the ancestor is requeued and re-releases
        // immediately (its watermark is untouched); chain 1's orphans do not.
        core.set_watermark(1, watermark(1, 1021, 103));
        let redelivered = core.drain_ready();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].chain_id(), 2);
        assert_eq!(redelivered[0].checkpoint().block_timestamp, 1020);
    }

    #[test]
    fn finalized_prunes_the_replay_ring() {
        let mut core = MergerCore::new([1], 100);
        core.push_events(1, vec![event(1, 1000, 10, 0), event(1, 1010, 11, 0)]);
        core.set_watermark(1, watermark(1, 1010, 11));
        core.drain_ready();
        assert_eq!(core.replay.len(), 2);

        let global = core
            .set_finalized(1, Checkpoint::block_end(1000, 1, 10))
            .unwrap();
        assert_eq!(global.block_timestamp, 1000);
        assert_eq!(core.replay.len(), 1);
    }

    #[test]
    fn buffer_accounting() {
        let mut core = MergerCore::new([1], 2);
        core.push_events(1, vec![event(1, 1000, 10, 0), event(1, 1001, 11, 0)]);
        assert!(core.is_full());
        core.set_watermark(1, watermark(1, 2000, 20));
        core.drain_ready();
        assert!(!core.is_full());
    }
}
