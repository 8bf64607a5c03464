//! Shared runtime state: per-chain sync status, readiness, metrics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::metrics::Metrics;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChainStatus {
    /// Highest block reported by this chain's sync.
    pub block: u64,
    pub timestamp: u64,
    /// False while the chain is still backfilling.
    pub is_realtime: bool,
}

pub struct AppState {
    statuses: RwLock<HashMap<u64, ChainStatus>>,
    /// Flips once the live-view cutover completes.
    ready: AtomicBool,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        AppState {
            statuses: RwLock::new(HashMap::new()),
            ready: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn statuses(&self) -> HashMap<u64, ChainStatus> {
        self.statuses.read().expect("status lock").clone()
    }

    pub fn update_chain(&self, chain_id: u64, block: u64, timestamp: u64) {
        let mut statuses = self.statuses.write().expect("status lock");
        let status = statuses.entry(chain_id).or_default();
        if block >= status.block {
            status.block = block;
            status.timestamp = timestamp;
        }
    }

    pub fn mark_realtime(&self, chain_id: u64) {
        self.statuses
            .write()
            .expect("status lock")
            .entry(chain_id)
            .or_default()
            .is_realtime = true;
    }
}
