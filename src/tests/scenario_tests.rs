//! End-to-end indexing scenarios, driven through the merger and runner with
//! synthetic per-chain streams against an in-memory database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chain_data::{Block, Log, Transaction};
use crate::checkpoint::Checkpoint;
use crate::config::{DatabaseConfig, DatabaseKind};
use crate::db::Database;
use crate::event::{build_events, Event};
use crate::handler::{HandlerRegistry, HandlerResult};
use crate::indexing::{IndexingRunner, RunnerExit};
use crate::metrics::Metrics;
use crate::registry::{compute_build_id, load_meta, InstanceRegistry};
use crate::source::{AbiEvent, AddressCriteria, FactoryCriteria, FactoryParameter, LogFilter, Source};
use crate::state::AppState;
use crate::store::schema::{Column, ColumnKind, TableSchema, UserSchema};
use crate::store::{IndexingStore, OnConflict};
use crate::sync::merger::EventMerger;
use crate::sync::{ChainMessage, SyncError};

fn counters_schema() -> UserSchema {
    UserSchema::new(vec![TableSchema {
        name: "counters".into(),
        columns: vec![
            Column::new("id", ColumnKind::Text).primary_key(),
            Column::new("value", ColumnKind::Integer),
        ],
        onchain: true,
    }])
    .unwrap()
}

fn obj(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().unwrap().clone()
}

async fn memory_database() -> Database {
    let config = DatabaseConfig {
        kind: DatabaseKind::Sqlite,
        connection_string: Some("sqlite::memory:".to_string()),
        schema: "public".to_string(),
    };
    let database = Database::connect(&config).await.unwrap();
    database.migrate().await.unwrap();
    database
}

/// A synthetic log event for `contract` at the given coordinates.
fn transfer_event(chain_id: u64, block_number: u64, timestamp: u64, log_index: u64) -> Event {
    let block = Block {
        number: block_number,
        hash: B256::repeat_byte(block_number as u8),
        parent_hash: B256::repeat_byte(block_number.wrapping_sub(1) as u8),
        timestamp,
        miner: Address::ZERO,
        gas_used: 0,
        gas_limit: 30_000_000,
        base_fee_per_gas: None,
        extra_data: Bytes::new(),
    };
    let transaction = Transaction {
        hash: B256::repeat_byte(0x40),
        block_number,
        block_hash: block.hash,
        transaction_index: 0,
        from: Address::repeat_byte(1),
        to: Some(Address::repeat_byte(2)),
        value: U256::ZERO,
        input: Bytes::new(),
        nonce: 0,
        gas: 21_000,
        gas_price: None,
    };
    let log = Log {
        address: Address::repeat_byte(0xaa),
        topics: vec![B256::repeat_byte(0x10)],
        data: Bytes::new(),
        block_number,
        block_hash: block.hash,
        block_timestamp: timestamp,
        transaction_hash: transaction.hash,
        transaction_index: 0,
        log_index,
    };
    Event::Log {
        checkpoint: Checkpoint {
            block_timestamp: timestamp,
            chain_id,
            block_number,
            transaction_index: 0,
            event_index: log_index,
        },
        contract: "Token".into(),
        event_name: "Transfer".into(),
        log,
        block,
        transaction,
        receipt: None,
    }
}

fn watermark(chain_id: u64, timestamp: u64, block: u64) -> Checkpoint {
    Checkpoint::block_end(timestamp, chain_id, block)
}

/// Counting handler: bumps `counters.events` per delivered Transfer, records
/// delivery order, and asserts the at-most-one-in-flight contract.
fn counting_handlers(
    order: Arc<Mutex<Vec<Checkpoint>>>,
    in_flight: Arc<AtomicUsize>,
) -> HandlerRegistry {
    HandlerRegistry::new("counting-v1").on("Token", "Transfer", move |event, store| {
        handle_transfer(event, store, order.clone(), in_flight.clone())
    })
}

fn handle_transfer(
    event: Event,
    store: Arc<IndexingStore>,
    order: Arc<Mutex<Vec<Checkpoint>>>,
    in_flight: Arc<AtomicUsize>,
) -> BoxFuture<'static, HandlerResult> {
    Box::pin(async move {
        assert_eq!(
            in_flight.fetch_add(1, Ordering::SeqCst),
            0,
            "more than one handler in flight"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
        order.lock().unwrap().push(event.checkpoint());

        match store.find("counters", &json!("events")).await? {
            Some(row) => {
                let value = row["value"].as_i64().unwrap_or(0) + 1;
                store
                    .update("counters", &json!("events"), obj(json!({ "value": value })))
                    .await?;
            }
            None => {
                store
                    .insert(
                        "counters",
                        obj(json!({ "id": "events", "value": 1 })),
                        OnConflict::Error,
                    )
                    .await?;
            }
        }

        in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    })
}

struct Harness {
    database: Database,
    store: Arc<IndexingStore>,
    registry: Arc<InstanceRegistry>,
    state: Arc<AppState>,
    chain_tx: Option<mpsc::Sender<ChainMessage>>,
    merger_handle: JoinHandle<Result<(), SyncError>>,
    runner_handle: JoinHandle<RunnerExit>,
}

/// What remains inspectable after the pipeline has drained.
struct FinishedHarness {
    database: Database,
    store: Arc<IndexingStore>,
    registry: Arc<InstanceRegistry>,
    state: Arc<AppState>,
}

impl FinishedHarness {
    async fn counter(&self) -> Option<i64> {
        self.store
            .find("counters", &json!("events"))
            .await
            .unwrap()
            .map(|row| row["value"].as_i64().unwrap())
    }

    async fn persisted_checkpoint(&self) -> Checkpoint {
        load_meta(self.database.pool())
            .await
            .unwrap()
            .into_iter()
            .find(|row| row.instance_id == self.registry.instance_id())
            .unwrap()
            .checkpoint
    }
}

impl Harness {
    async fn start(
        chains: Vec<u64>,
        handlers: HandlerRegistry,
        database: Option<Database>,
        build_tag: &str,
        now: i64,
    ) -> Self {
        let database = match database {
            Some(database) => database,
            None => memory_database().await,
        };
        let schema = counters_schema();
        let build_id = compute_build_id(build_tag, &schema.fingerprint(), handlers.fingerprint(), false);
        let (registry, resume_from) =
            InstanceRegistry::register(&database, build_id, schema.clone(), false, now)
                .await
                .unwrap();
        let registry = Arc::new(registry);
        let store = Arc::new(
            IndexingStore::attach(&database, registry.instance_id(), schema)
                .await
                .unwrap(),
        );
        let state = Arc::new(AppState::new(Arc::new(Metrics::new())));

        let (chain_tx, chain_rx) = mpsc::channel(64);
        let (index_tx, index_rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let merger = EventMerger::new(chains, chain_rx, index_tx, state.clone());
        let merger_handle = tokio::spawn(merger.run(shutdown.clone()));
        let runner = IndexingRunner::new(
            index_rx,
            store.clone(),
            registry.clone(),
            Arc::new(handlers),
            state.clone(),
            resume_from,
            false,
        );
        let runner_handle = tokio::spawn(runner.run(shutdown));

        Harness {
            database,
            store,
            registry,
            state,
            chain_tx: Some(chain_tx),
            merger_handle,
            runner_handle,
        }
    }

    async fn send(&self, message: ChainMessage) {
        self.chain_tx
            .as_ref()
            .expect("harness already finished")
            .send(message)
            .await
            .unwrap();
    }

    /// Close the chain streams and wait for the pipeline to drain.
    async fn finish(mut self) -> (RunnerExit, FinishedHarness) {
        self.chain_tx.take();
        let _ = self.merger_handle.await;
        let exit = self.runner_handle.await.unwrap();
        (
            exit,
            FinishedHarness {
                database: self.database,
                store: self.store,
                registry: self.registry,
                state: self.state,
            },
        )
    }
}

// S1: single chain, no reorg. Three events, counter ends at 3, checkpoint
// lands on the last event.
#[tokio::test]
async fn s1_single_chain_no_reorg() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let harness = Harness::start(
        vec![1],
        counting_handlers(order.clone(), in_flight),
        None,
        "s1",
        1_000,
    )
    .await;

    let events = vec![
        transfer_event(1, 100, 1_000, 0),
        transfer_event(1, 101, 1_001, 0),
        transfer_event(1, 102, 1_002, 0),
    ];
    let last = events.last().unwrap().checkpoint();
    harness
        .send(ChainMessage::Events {
            chain_id: 1,
            events,
            watermark: watermark(1, 1_002, 102),
        })
        .await;

    let (exit, harness) = harness.finish().await;
    assert!(matches!(exit, RunnerExit::Stopped));
    assert_eq!(harness.counter().await, Some(3));
    assert_eq!(harness.persisted_checkpoint().await, last);
    assert_eq!(order.lock().unwrap().len(), 3);
}

// S2: shallow reorg. Blocks 103-104 are replaced; their writes roll back
// and the replacement events index.
#[tokio::test]
async fn s2_shallow_reorg_rolls_back_and_redelivers() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let harness = Harness::start(
        vec![1],
        counting_handlers(order.clone(), in_flight),
        None,
        "s2",
        1_000,
    )
    .await;

    // Blocks 100-104 delivered.
    let events: Vec<Event> = (100..=104)
        .map(|n| transfer_event(1, n, 900 + n, 0))
        .collect();
    harness
        .send(ChainMessage::Events {
            chain_id: 1,
            events,
            watermark: watermark(1, 1_004, 104),
        })
        .await;

    // The tip switches: 103-104 replaced by 103'-104'.
    let ancestor = Checkpoint::block_end(1_002, 1, 102);
    harness
        .send(ChainMessage::Reorg {
            chain_id: 1,
            ancestor,
            depth: 2,
        })
        .await;
    harness
        .send(ChainMessage::Events {
            chain_id: 1,
            events: vec![
                transfer_event(1, 103, 1_008, 0),
                transfer_event(1, 104, 1_009, 0),
            ],
            watermark: watermark(1, 1_009, 104),
        })
        .await;

    let (exit, harness) = harness.finish().await;
    assert!(matches!(exit, RunnerExit::Stopped));
    // 3 canonical events below the ancestor + 2 replacements.
    assert_eq!(harness.counter().await, Some(5));
    // 5 original deliveries + 2 re-deliveries were observed in total.
    assert_eq!(order.lock().unwrap().len(), 7);
}

// S3: two chains, delivery follows block timestamps across chains.
#[tokio::test]
async fn s3_two_chains_ordered_by_timestamp() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let harness = Harness::start(
        vec![1, 2],
        counting_handlers(order.clone(), in_flight),
        None,
        "s3",
        1_000,
    )
    .await;

    harness
        .send(ChainMessage::Events {
            chain_id: 1,
            events: vec![
                transfer_event(1, 10, 1_000, 0),
                transfer_event(1, 11, 1_001, 0),
            ],
            watermark: watermark(1, 1_001, 11),
        })
        .await;
    harness
        .send(ChainMessage::Events {
            chain_id: 2,
            events: vec![transfer_event(2, 50, 999, 0)],
            watermark: watermark(2, 1_002, 51),
        })
        .await;

    let (_, harness) = harness.finish().await;
    assert_eq!(harness.counter().await, Some(3));
    let delivered: Vec<(u64, u64)> = order
        .lock()
        .unwrap()
        .iter()
        .map(|c| (c.block_timestamp, c.chain_id))
        .collect();
    assert_eq!(delivered, vec![(999, 2), (1_000, 1), (1_001, 1)]);
}

// S4: crash resume. A second instance with the same build id adopts the
// dead instance's id and skips everything at or below its checkpoint.
#[tokio::test]
async fn s4_crash_resume_adopts_and_skips() {
    let database = memory_database().await;
    let order_a = Arc::new(Mutex::new(Vec::new()));
    let harness_a = Harness::start(
        vec![1],
        counting_handlers(order_a, Arc::new(AtomicUsize::new(0))),
        Some(database.clone()),
        "s4",
        1_000,
    )
    .await;
    let instance_a = harness_a.registry.instance_id().to_string();

    // A processes through C = (1005, 1, 50, 0, 0) and "crashes" (no clean
    // stop, heartbeat goes stale).
    let c = Checkpoint {
        block_timestamp: 1_005,
        chain_id: 1,
        block_number: 50,
        transaction_index: 0,
        event_index: 0,
    };
    harness_a
        .send(ChainMessage::Events {
            chain_id: 1,
            events: vec![
                transfer_event(1, 48, 1_003, 0),
                transfer_event(1, 49, 1_004, 0),
                transfer_event(1, 50, 1_005, 0),
            ],
            watermark: watermark(1, 1_005, 50),
        })
        .await;
    let (_, harness_a) = harness_a.finish().await;
    assert_eq!(harness_a.persisted_checkpoint().await, c);
    assert_eq!(harness_a.counter().await, Some(3));

    // B starts 100 "seconds" later with the identical build.
    let order_b = Arc::new(Mutex::new(Vec::new()));
    let harness_b = Harness::start(
        vec![1],
        counting_handlers(order_b.clone(), Arc::new(AtomicUsize::new(0))),
        Some(database),
        "s4",
        1_100,
    )
    .await;
    assert_eq!(harness_b.registry.instance_id(), instance_a);

    // Re-delivery at or below C is skipped; only the new event indexes.
    harness_b
        .send(ChainMessage::Events {
            chain_id: 1,
            events: vec![
                transfer_event(1, 50, 1_005, 0),
                transfer_event(1, 51, 1_006, 0),
            ],
            watermark: watermark(1, 1_006, 51),
        })
        .await;
    let (_, harness_b) = harness_b.finish().await;
    assert_eq!(harness_b.counter().await, Some(4));
    let order_b = order_b.lock().unwrap();
    assert_eq!(order_b.len(), 1);
    assert!(order_b[0] > c);
}

// S5: factory pattern. A child created at block 200 becomes active and its
// log at block 250 produces an event.
#[tokio::test]
async fn s5_factory_child_activation() {
    let parent = Address::repeat_byte(0x0f);
    let child = Address::repeat_byte(0xaa);
    let creation = AbiEvent::parse("ChildCreated(address)").unwrap();
    let transfer = AbiEvent::parse("Transfer(address,address,uint256)").unwrap();
    let source = Source {
        name: "Pool".into(),
        network: "mainnet".into(),
        chain_id: 1,
        address: AddressCriteria::Factory(FactoryCriteria {
            address: parent,
            event_topic0: creation.topic0,
            parameter: FactoryParameter::Topic1,
        }),
        events: vec![transfer.clone()],
        filter: LogFilter::default(),
        start_block: 100,
        end_block: None,
        include_transaction_receipts: false,
    };

    let mut children: HashMap<String, Vec<Address>> = HashMap::new();

    // Block 200: the creation log on the parent.
    let mut child_word = [0u8; 32];
    child_word[12..].copy_from_slice(child.as_slice());
    let creation_block = Block {
        number: 200,
        hash: B256::repeat_byte(200u8),
        parent_hash: B256::repeat_byte(199u8),
        timestamp: 2_000,
        miner: Address::ZERO,
        gas_used: 0,
        gas_limit: 0,
        base_fee_per_gas: None,
        extra_data: Bytes::new(),
    };
    let creation_log = Log {
        address: parent,
        topics: vec![creation.topic0, B256::from(child_word)],
        data: Bytes::new(),
        block_number: 200,
        block_hash: creation_block.hash,
        block_timestamp: 2_000,
        transaction_hash: B256::repeat_byte(0x51),
        transaction_index: 0,
        log_index: 0,
    };
    if let AddressCriteria::Factory(factory) = &source.address {
        if let Some(discovered) = factory.child_address(&creation_log) {
            children.entry(source.name.clone()).or_default().push(discovered);
        }
    }
    assert_eq!(children["Pool"], vec![child]);

    // Block 250: the child emits a Transfer; it is now a live address.
    let event_block = Block {
        number: 250,
        hash: B256::repeat_byte(250u8),
        parent_hash: B256::repeat_byte(249u8),
        timestamp: 2_500,
        miner: Address::ZERO,
        gas_used: 0,
        gas_limit: 0,
        base_fee_per_gas: None,
        extra_data: Bytes::new(),
    };
    let transaction = Transaction {
        hash: B256::repeat_byte(0x52),
        block_number: 250,
        block_hash: event_block.hash,
        transaction_index: 0,
        from: Address::repeat_byte(1),
        to: Some(child),
        value: U256::ZERO,
        input: Bytes::new(),
        nonce: 0,
        gas: 21_000,
        gas_price: None,
    };
    let child_log = Log {
        address: child,
        topics: vec![transfer.topic0],
        data: Bytes::new(),
        block_number: 250,
        block_hash: event_block.hash,
        block_timestamp: 2_500,
        transaction_hash: transaction.hash,
        transaction_index: 0,
        log_index: 3,
    };

    let events = build_events(
        1,
        &event_block,
        std::slice::from_ref(&child_log),
        std::slice::from_ref(&transaction),
        &[],
        std::slice::from_ref(&source),
        &children,
    );
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].contract(), "Pool");
    assert_eq!(events[0].event_name(), "Transfer");
    assert_eq!(events[0].checkpoint().block_number, 250);

    // Without the discovered child the same log matches nothing.
    let events = build_events(
        1,
        &event_block,
        std::slice::from_ref(&child_log),
        std::slice::from_ref(&transaction),
        &[],
        std::slice::from_ref(&source),
        &HashMap::new(),
    );
    assert!(events.is_empty());
}

// S6: an idle chain advancing only its watermark does not block the other
// chain's events.
#[tokio::test]
async fn s6_idle_chain_does_not_stall_delivery() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let harness = Harness::start(
        vec![1, 2],
        counting_handlers(order, Arc::new(AtomicUsize::new(0))),
        None,
        "s6",
        1_000,
    )
    .await;

    harness
        .send(ChainMessage::Events {
            chain_id: 1,
            events: vec![
                transfer_event(1, 100, 1_000, 0),
                transfer_event(1, 101, 1_001, 0),
            ],
            watermark: watermark(1, 1_001, 101),
        })
        .await;
    // Chain 2 produced no events for a minute; its sync repeats the tip
    // watermark so the merger can release chain 1.
    harness
        .send(ChainMessage::Watermark {
            chain_id: 2,
            watermark: watermark(2, 1_005, 40),
        })
        .await;

    let (_, harness) = harness.finish().await;
    assert_eq!(harness.counter().await, Some(2));
}

// Cutover happens once every chain finishes its backfill; /ready flips and
// the public view serves the live instance's rows.
#[tokio::test]
async fn cutover_after_historical_complete() {
    let harness = Harness::start(
        vec![1],
        counting_handlers(Arc::new(Mutex::new(Vec::new())), Arc::new(AtomicUsize::new(0))),
        None,
        "cutover",
        1_000,
    )
    .await;

    harness
        .send(ChainMessage::Events {
            chain_id: 1,
            events: vec![transfer_event(1, 100, 1_000, 0)],
            watermark: watermark(1, 1_000, 100),
        })
        .await;
    assert!(!harness.state.is_ready());
    harness
        .send(ChainMessage::HistoricalComplete { chain_id: 1 })
        .await;

    let (_, harness) = harness.finish().await;
    assert!(harness.state.is_ready());
    let through_view: i64 = sqlx::query_scalar("SELECT value FROM \"counters\"")
        .fetch_one(harness.database.pool())
        .await
        .unwrap();
    assert_eq!(through_view, 1);
}

// A failing handler terminates indexing and reports the failing event.
#[tokio::test]
async fn handler_errors_are_fatal_with_context() {
    let handlers = HandlerRegistry::new("failing-v1").on("Token", "Transfer", |event, _store| {
        Box::pin(async move {
            if event.checkpoint().block_number == 101 {
                Err(crate::handler::HandlerError::Message("boom".into()))
            } else {
                Ok(())
            }
        })
    });
    let harness = Harness::start(vec![1], handlers, None, "failing", 1_000).await;
    harness
        .send(ChainMessage::Events {
            chain_id: 1,
            events: vec![
                transfer_event(1, 100, 1_000, 0),
                transfer_event(1, 101, 1_001, 0),
            ],
            watermark: watermark(1, 1_001, 101),
        })
        .await;
    let (exit, _harness) = harness.finish().await;
    match exit {
        RunnerExit::HandlerFailed {
            contract,
            event,
            checkpoint,
            ..
        } => {
            assert_eq!(contract, "Token");
            assert_eq!(event, "Transfer");
            assert_eq!(checkpoint.block_number, 101);
        }
        other => panic!("expected handler failure, got {other:?}"),
    }
}

// A deep reorg message stops the pipeline with a fatal exit.
#[tokio::test]
async fn deep_reorg_is_fatal() {
    let harness = Harness::start(
        vec![1],
        counting_handlers(Arc::new(Mutex::new(Vec::new())), Arc::new(AtomicUsize::new(0))),
        None,
        "deep",
        1_000,
    )
    .await;
    harness.send(ChainMessage::DeepReorg { chain_id: 1 }).await;
    let (exit, _harness) = harness.finish().await;
    assert!(matches!(exit, RunnerExit::DeepReorg { chain_id: 1 }));
}

// Journal rows at or below the finalized checkpoint are pruned as the
// finalized boundary advances.
#[tokio::test]
async fn finalized_advance_prunes_the_journal() {
    let harness = Harness::start(
        vec![1],
        counting_handlers(Arc::new(Mutex::new(Vec::new())), Arc::new(AtomicUsize::new(0))),
        None,
        "prune",
        1_000,
    )
    .await;
    harness
        .send(ChainMessage::Events {
            chain_id: 1,
            events: vec![
                transfer_event(1, 100, 1_000, 0),
                transfer_event(1, 101, 1_001, 0),
            ],
            watermark: watermark(1, 1_001, 101),
        })
        .await;
    harness
        .send(ChainMessage::Finalized {
            chain_id: 1,
            checkpoint: Checkpoint::block_end(1_000, 1, 100),
        })
        .await;

    let (_, harness) = harness.finish().await;
    let journal_table = format!("{}_reorg__counters", harness.registry.instance_id());
    let remaining: i64 =
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{journal_table}\""))
            .fetch_one(harness.database.pool())
            .await
            .unwrap();
    // Only block 101's journal rows survive the prune.
    let expected: i64 = 1;
    assert_eq!(remaining, expected);
}
