//! The indexing runner: dispatches merged events to user handlers.
//!
//! At most one handler invocation is ever in flight. Each event's checkpoint
//! is stamped on the store before dispatch so journal rows carry it, and the
//! committed checkpoint is persisted after every released batch. Reorg
//! messages pause delivery, roll the journal back to the ancestor, and
//! rewind the committed checkpoint so re-delivered events index again.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::event::Event;
use crate::handler::{HandlerError, HandlerRegistry};
use crate::registry::InstanceRegistry;
use crate::state::AppState;
use crate::store::{journal, IndexingStore};
use crate::sync::merger::IndexingMessage;

/// Why the runner stopped.
#[derive(Debug)]
pub enum RunnerExit {
    /// Input stream ended or shutdown was requested.
    Stopped,
    /// A chain reorganized deeper than its finality window.
    DeepReorg { chain_id: u64 },
    /// A handler returned an error; the failing event is attached.
    HandlerFailed {
        contract: String,
        event: String,
        checkpoint: Checkpoint,
        error: HandlerError,
    },
    /// The store or registry failed unrecoverably.
    Internal(String),
}

pub struct IndexingRunner {
    receiver: mpsc::Receiver<IndexingMessage>,
    store: Arc<IndexingStore>,
    registry: Arc<InstanceRegistry>,
    handlers: Arc<HandlerRegistry>,
    state: Arc<AppState>,
    /// Checkpoint of the last indexed event; events at or below it are
    /// skipped (crash resume, reorg re-delivery).
    committed: Checkpoint,
    dev: bool,
}

impl IndexingRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        receiver: mpsc::Receiver<IndexingMessage>,
        store: Arc<IndexingStore>,
        registry: Arc<InstanceRegistry>,
        handlers: Arc<HandlerRegistry>,
        state: Arc<AppState>,
        resume_from: Option<Checkpoint>,
        dev: bool,
    ) -> Self {
        IndexingRunner {
            receiver,
            store,
            registry,
            handlers,
            state,
            committed: resume_from.unwrap_or(Checkpoint::ZERO),
            dev,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> RunnerExit {
        loop {
            tokio::select! {
                message = self.receiver.recv() => {
                    let Some(message) = message else {
                        return RunnerExit::Stopped;
                    };
                    match self.handle(message).await {
                        Ok(None) => {}
                        Ok(Some(exit)) => return exit,
                        Err(exit) => return exit,
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("indexing runner stopping");
                    return RunnerExit::Stopped;
                }
            }
        }
    }

    async fn handle(&mut self, message: IndexingMessage) -> Result<Option<RunnerExit>, RunnerExit> {
        match message {
            IndexingMessage::Events(events) => {
                for event in events {
                    if let Some(exit) = self.dispatch(event).await? {
                        return Ok(Some(exit));
                    }
                }
                self.persist_checkpoint().await?;
            }
            IndexingMessage::Reorg {
                chain_id,
                ancestor,
                depth,
            } => {
                warn!(chain_id, depth, %ancestor, "rolling user tables back");
                journal::rollback(
                    self.store.pool(),
                    self.store.instance_id(),
                    self.store.schema(),
                    ancestor,
                )
                .await
                .map_err(|e| RunnerExit::Internal(e.to_string()))?;
                if ancestor < self.committed {
                    self.committed = ancestor;
                }
                self.persist_checkpoint().await?;
            }
            IndexingMessage::Finalized(checkpoint) => {
                let pruned = journal::prune(
                    self.store.pool(),
                    self.store.instance_id(),
                    self.store.schema(),
                    checkpoint,
                )
                .await
                .map_err(|e| RunnerExit::Internal(e.to_string()))?;
                if pruned > 0 {
                    debug!(pruned, %checkpoint, "journal pruned below finalized");
                }
            }
            IndexingMessage::HistoricalComplete => {
                // Dev instances cut over at startup; everyone else goes
                // live once the backfill lands.
                if !self.dev {
                    self.registry
                        .cutover()
                        .await
                        .map_err(|e| RunnerExit::Internal(e.to_string()))?;
                }
                self.state.set_ready();
                if let Err(error) = self.registry.stale_gc(unix_now()).await {
                    warn!(%error, "stale instance gc failed");
                }
            }
            IndexingMessage::Fatal { chain_id } => {
                return Ok(Some(RunnerExit::DeepReorg { chain_id }));
            }
        }
        Ok(None)
    }

    async fn dispatch(&mut self, event: Event) -> Result<Option<RunnerExit>, RunnerExit> {
        let checkpoint = event.checkpoint();
        if checkpoint <= self.committed {
            // Already indexed before a crash or re-delivered below the
            // committed watermark.
            return Ok(None);
        }

        if let Some(handler) = self.handlers.get(event.contract(), event.event_name()) {
            self.store.set_checkpoint(checkpoint);
            if let Err(error) = handler(event.clone(), self.store.clone()).await {
                self.state.metrics.handler_errors.inc();
                error!(
                    contract = event.contract(),
                    event = event.event_name(),
                    %checkpoint,
                    %error,
                    "handler failed"
                );
                return Ok(Some(RunnerExit::HandlerFailed {
                    contract: event.contract().to_string(),
                    event: event.event_name().to_string(),
                    checkpoint,
                    error,
                }));
            }
        }

        self.committed = checkpoint;
        self.state.metrics.events_indexed.inc();
        self.state
            .metrics
            .checkpoint_timestamp
            .set(checkpoint.block_timestamp as i64);
        Ok(None)
    }

    async fn persist_checkpoint(&self) -> Result<(), RunnerExit> {
        self.registry
            .set_checkpoint(self.committed)
            .await
            .map_err(|e| RunnerExit::Internal(e.to_string()))
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
