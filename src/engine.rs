//! The orchestrator: wires configuration, database, registry, sync tasks,
//! merger, and the indexing runner together, and owns the shutdown
//! sequence and exit-code policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::{Config, ConfigError, NetworkConfig};
use crate::db::Database;
use crate::handler::{HandlerError, HandlerRegistry};
use crate::indexing::{unix_now, IndexingRunner, RunnerExit};
use crate::metrics::Metrics;
use crate::registry::{
    compute_build_id, InstanceRegistry, InstanceStatus, RegistryError, HEARTBEAT_INTERVAL_SECS,
    STALE_AFTER_SECS,
};
use crate::rpc::RpcClient;
use crate::server;
use crate::source::Source;
use crate::state::AppState;
use crate::store::schema::{SchemaError, UserSchema};
use crate::store::{IndexingStore, StoreError};
use crate::sync::cache::SyncCache;
use crate::sync::historical::{HistoricalSync, INITIAL_CHUNK_SIZE};
use crate::sync::merger::EventMerger;
use crate::sync::realtime::RealtimeSync;
use crate::sync::{ChainMessage, SyncError};
use thiserror::Error;

const CHUNK_CEILING_MULTIPLIER: u64 = 10;
const CHAIN_CHANNEL_CAPACITY: usize = 1024;
const INDEX_CHANNEL_CAPACITY: usize = 64;
/// Hard deadline for draining tasks at shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("failed to bind server: {0}")]
    Io(#[from] std::io::Error),

    #[error("handler {contract}.{event} failed at {checkpoint}: {source}")]
    Handler {
        contract: String,
        event: String,
        checkpoint: Checkpoint,
        source: HandlerError,
    },

    #[error("deep reorg on chain {chain_id}")]
    DeepReorg { chain_id: u64 },

    #[error("heartbeat lost")]
    HeartbeatLost,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// 0 is a clean stop; 75 asks the supervisor for a restart.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::HeartbeatLost => 75,
            _ => 1,
        }
    }
}

pub struct Engine {
    config: Config,
    schema: UserSchema,
    handlers: Arc<HandlerRegistry>,
}

impl Engine {
    pub fn new(
        config: Config,
        schema: UserSchema,
        handlers: HandlerRegistry,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Engine {
            config,
            schema,
            handlers: Arc::new(handlers),
        })
    }

    /// Run until the event stream ends, a fatal error occurs, or `shutdown`
    /// is cancelled. Tables and views are never dropped on the way out.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), EngineError> {
        let sources = self.config.sources()?;
        let database = Database::connect(&self.config.database).await?;
        database.migrate().await?;

        let metrics = Arc::new(Metrics::new());
        let state = Arc::new(AppState::new(metrics));

        // The status surface answers /health before anything else starts.
        let address = format!("{}:{}", self.config.server_host, self.config.server_port);
        let listener = TcpListener::bind(&address).await?;
        info!(%address, "status server listening");
        let server_token = shutdown.clone();
        let router = server::create_router(state.clone());
        let server_handle: JoinHandle<()> = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_token.cancelled().await })
                .await
            {
                error!(%error, "status server failed");
            }
        });

        let build_id = compute_build_id(
            &self.config.fingerprint(),
            &self.schema.fingerprint(),
            self.handlers.fingerprint(),
            self.config.dev,
        );
        let (registry, resume_from) = InstanceRegistry::register(
            &database,
            build_id,
            self.schema.clone(),
            self.config.dev,
            unix_now(),
        )
        .await?;
        let registry = Arc::new(registry);
        let store = Arc::new(
            IndexingStore::attach(&database, registry.instance_id(), self.schema.clone()).await?,
        );
        if self.config.dev {
            registry.cutover().await?;
            state.set_ready();
        }

        let cache = SyncCache::new(database.clone());
        let (chain_tx, chain_rx) = mpsc::channel::<ChainMessage>(CHAIN_CHANNEL_CAPACITY);
        let (index_tx, index_rx) = mpsc::channel(INDEX_CHANNEL_CAPACITY);

        // One sync task per network that has sources.
        let mut by_chain: HashMap<u64, (String, NetworkConfig, Vec<Source>)> = HashMap::new();
        for (name, network) in &self.config.networks {
            let chain_sources: Vec<Source> = sources
                .iter()
                .filter(|s| s.chain_id == network.chain_id)
                .cloned()
                .collect();
            if !chain_sources.is_empty() {
                by_chain.insert(
                    network.chain_id,
                    (name.clone(), network.clone(), chain_sources),
                );
            }
        }
        let chain_ids: Vec<u64> = by_chain.keys().copied().collect();

        let internal = shutdown.child_token();
        let fatal: Arc<Mutex<Option<EngineError>>> = Arc::new(Mutex::new(None));

        let merger = EventMerger::new(chain_ids, chain_rx, index_tx, state.clone());
        let merger_token = internal.clone();
        let merger_handle = tokio::spawn(async move { merger.run(merger_token).await });

        let mut chain_handles = Vec::new();
        for (chain_id, (name, network, chain_sources)) in by_chain {
            let url = network.resolve_transport(&name)?;
            let client = Arc::new(
                RpcClient::new(chain_id, url, &network).with_metrics(state.metrics.clone()),
            );
            let task_metrics = state.metrics.clone();
            let task_cache = cache.clone();
            let task_sender = chain_tx.clone();
            let task_token = internal.clone();
            let task_fatal = fatal.clone();
            let task_internal = internal.clone();
            chain_handles.push(tokio::spawn(async move {
                if let Err(error) = run_chain(
                    chain_id,
                    network,
                    client,
                    task_cache,
                    chain_sources,
                    task_sender,
                    task_metrics,
                    task_token,
                )
                .await
                {
                    match &error {
                        SyncError::ChannelClosed => {}
                        _ => {
                            error!(chain_id, %error, "chain sync failed");
                            let mut slot = task_fatal.lock().expect("fatal slot lock");
                            if slot.is_none() {
                                *slot = Some(EngineError::Sync(error));
                            }
                            drop(slot);
                            task_internal.cancel();
                        }
                    }
                }
            }));
        }
        // The merger ends when every chain sender is gone.
        drop(chain_tx);

        let heartbeat_handle = spawn_heartbeat(
            registry.clone(),
            internal.clone(),
            fatal.clone(),
        );

        let runner = IndexingRunner::new(
            index_rx,
            store,
            registry.clone(),
            self.handlers.clone(),
            state,
            resume_from,
            self.config.dev,
        );
        let exit = runner.run(internal.clone()).await;

        // Teardown: stop everything, flush the stopped status, close pools.
        internal.cancel();
        for handle in chain_handles {
            join_with_deadline(handle, "chain sync").await;
        }
        join_with_deadline(merger_handle, "merger").await;
        join_with_deadline(heartbeat_handle, "heartbeat").await;
        join_with_deadline(server_handle, "status server").await;

        if let Err(error) = registry.set_status(InstanceStatus::Stopped).await {
            warn!(%error, "could not flush stopped status");
        }
        database.close().await;

        let fatal = fatal.lock().expect("fatal slot lock").take();
        match exit {
            RunnerExit::Stopped => match fatal {
                Some(error) => Err(error),
                None => {
                    info!("engine stopped cleanly");
                    Ok(())
                }
            },
            RunnerExit::DeepReorg { chain_id } => Err(EngineError::DeepReorg { chain_id }),
            RunnerExit::HandlerFailed {
                contract,
                event,
                checkpoint,
                error,
            } => Err(EngineError::Handler {
                contract,
                event,
                checkpoint,
                source: error,
            }),
            RunnerExit::Internal(detail) => Err(EngineError::Internal(detail)),
        }
    }
}

/// Backfill to the finalized tip, then follow the chain live.
#[allow(clippy::too_many_arguments)]
async fn run_chain(
    chain_id: u64,
    network: NetworkConfig,
    client: Arc<RpcClient>,
    cache: SyncCache,
    sources: Vec<Source>,
    sender: mpsc::Sender<ChainMessage>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> Result<(), SyncError> {
    let head = client.get_block_number().await?;
    let finalized = head.saturating_sub(network.finality_depth);
    cache.set_finalized(chain_id, finalized);

    let historical = HistoricalSync::new(
        chain_id,
        client.clone(),
        cache.clone(),
        sources.clone(),
        sender.clone(),
        !network.disable_cache,
        INITIAL_CHUNK_SIZE * CHUNK_CEILING_MULTIPLIER,
    )
    .with_metrics(metrics);
    let outcome = historical.run(finalized, shutdown.clone()).await?;

    sender
        .send(ChainMessage::Finalized {
            chain_id,
            checkpoint: outcome.finalized_checkpoint,
        })
        .await
        .map_err(|_| SyncError::ChannelClosed)?;

    let realtime = RealtimeSync::new(
        chain_id,
        &network,
        client,
        cache,
        sources,
        sender,
        outcome.finalized_block,
        outcome.factory_children,
    );
    realtime.run(shutdown).await
}

/// Update `heartbeat_at` every ten seconds. Failing to land a heartbeat for
/// the staleness window demotes the instance and asks for a restart.
fn spawn_heartbeat(
    registry: Arc<InstanceRegistry>,
    shutdown: CancellationToken,
    fatal: Arc<Mutex<Option<EngineError>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_success = Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match registry.heartbeat(unix_now()).await {
                        Ok(()) => last_success = Instant::now(),
                        Err(error) => {
                            warn!(%error, "heartbeat failed");
                            if last_success.elapsed() > Duration::from_secs(STALE_AFTER_SECS as u64) {
                                let mut slot = fatal.lock().expect("fatal slot lock");
                                if slot.is_none() {
                                    *slot = Some(EngineError::HeartbeatLost);
                                }
                                drop(slot);
                                shutdown.cancel();
                                return;
                            }
                        }
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    })
}

async fn join_with_deadline<T>(handle: JoinHandle<T>, name: &str) {
    if tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await.is_err() {
        warn!(task = name, "did not stop within the shutdown deadline");
    }
}
